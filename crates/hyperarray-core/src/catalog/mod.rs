//! Kernel catalog.
//!
//! Maps logical kernel names to driver entry points. Modules are loaded from
//! binaries named by manifest files found under a kernel directory; each
//! kernel line in a module block resolves a symbol inside that module.
//!
//! Loading never aborts on a single bad entry. Missing binaries, failed
//! resolutions and malformed lines are logged and counted in the returned
//! [`CatalogReport`]; a kernel that failed to resolve is simply absent and
//! launching it reports [`ComputeError::KernelNotFound`].

mod manifest;

pub use manifest::{Manifest, ManifestEntry};

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::driver::{check, Driver, FunctionHandle, ModuleHandle};
use crate::error::{ComputeError, Result};

/// Outcome counters for a catalog load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogReport {
    /// Manifest files processed.
    pub manifests: usize,
    /// Modules loaded.
    pub modules_loaded: usize,
    /// Modules whose binary was missing or rejected.
    pub modules_failed: usize,
    /// Kernels resolved and recorded.
    pub kernels_resolved: usize,
    /// Kernels that failed to resolve.
    pub kernels_failed: usize,
    /// Kernel lines outside any module block.
    pub orphaned: usize,
    /// Lines matching neither record form.
    pub malformed: usize,
}

impl CatalogReport {
    fn absorb(&mut self, other: CatalogReport) {
        self.manifests += other.manifests;
        self.modules_loaded += other.modules_loaded;
        self.modules_failed += other.modules_failed;
        self.kernels_resolved += other.kernels_resolved;
        self.kernels_failed += other.kernels_failed;
        self.orphaned += other.orphaned;
        self.malformed += other.malformed;
    }
}

impl fmt::Display for CatalogReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} manifests, {} modules ({} failed), {} kernels ({} failed)",
            self.manifests,
            self.modules_loaded,
            self.modules_failed,
            self.kernels_resolved,
            self.kernels_failed
        )
    }
}

/// A module block being filled while walking a manifest.
struct OpenBlock {
    name: String,
    module: Option<ModuleHandle>,
    expected: usize,
    resolved: usize,
}

impl OpenBlock {
    fn close(self) {
        if self.module.is_some() && self.resolved != self.expected {
            warn!(
                module = %self.name,
                expected = self.expected,
                resolved = self.resolved,
                "Module kernel count differs from manifest"
            );
        }
    }
}

/// Loaded modules and the logical kernel table.
pub struct KernelCatalog {
    driver: Arc<dyn Driver>,
    modules: HashMap<String, ModuleHandle>,
    functions: HashMap<String, (ModuleHandle, FunctionHandle)>,
}

impl KernelCatalog {
    /// Creates an empty catalog.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            modules: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    /// Finds every file named `manifest_name` below `kernel_dir` and loads it.
    ///
    /// Binaries are looked up as `<module>.<binary_extension>` next to each
    /// manifest. A missing `kernel_dir` yields an empty report.
    pub fn discover(
        &mut self,
        kernel_dir: &Path,
        manifest_name: &str,
        binary_extension: &str,
    ) -> CatalogReport {
        let mut report = CatalogReport::default();
        if !kernel_dir.is_dir() {
            warn!(dir = %kernel_dir.display(), "Kernel directory not found, no kernels loaded");
            return report;
        }

        let manifests: Vec<PathBuf> = WalkDir::new(kernel_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable kernel directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == manifest_name)
            .map(walkdir::DirEntry::into_path)
            .collect();

        for path in manifests {
            match Manifest::from_file(&path) {
                Ok(manifest) => report.absorb(self.load_manifest(&manifest, binary_extension)),
                Err(e) => warn!(error = %e, "Skipping manifest"),
            }
        }

        info!(dir = %kernel_dir.display(), %report, "Kernel discovery complete");
        report
    }

    /// Loads the modules and kernels a parsed manifest declares.
    ///
    /// Binaries resolve against the manifest's directory, or the working
    /// directory for a manifest parsed from text.
    pub fn load_manifest(&mut self, manifest: &Manifest, binary_extension: &str) -> CatalogReport {
        let base_dir = manifest.base_dir().unwrap_or_else(|| Path::new(""));
        let mut report = CatalogReport {
            manifests: 1,
            ..CatalogReport::default()
        };
        let mut block: Option<OpenBlock> = None;

        for entry in manifest.entries() {
            match entry {
                ManifestEntry::Module {
                    name,
                    expected,
                    line,
                } => {
                    if let Some(previous) = block.take() {
                        previous.close();
                    }
                    let path = base_dir.join(format!("{name}.{binary_extension}"));
                    let module = match self.load_module_file(name, &path) {
                        Ok(module) => {
                            report.modules_loaded += 1;
                            Some(module)
                        }
                        Err(e) => {
                            warn!(module = %name, line, error = %e, "Module not loaded");
                            report.modules_failed += 1;
                            None
                        }
                    };
                    block = Some(OpenBlock {
                        name: name.clone(),
                        module,
                        expected: *expected,
                        resolved: 0,
                    });
                }
                ManifestEntry::Kernel {
                    logical,
                    symbol,
                    line,
                } => {
                    let Some(open) = block.as_mut() else {
                        warn!(kernel = %logical, line, "Kernel line before any module, ignored");
                        report.orphaned += 1;
                        continue;
                    };
                    let resolved = match open.module {
                        Some(module) => self.register_in(module, logical, symbol).is_ok(),
                        None => {
                            warn!(
                                kernel = %logical,
                                module = %open.name,
                                line,
                                "Kernel skipped, module not loaded"
                            );
                            false
                        }
                    };
                    if resolved {
                        open.resolved += 1;
                        report.kernels_resolved += 1;
                    } else {
                        report.kernels_failed += 1;
                    }
                }
                ManifestEntry::Malformed { line, text } => {
                    warn!(line, text = %text, "Malformed manifest line");
                    report.malformed += 1;
                }
            }
        }
        if let Some(last) = block {
            last.close();
        }
        report
    }

    fn load_module_file(&mut self, name: &str, path: &Path) -> Result<ModuleHandle> {
        if let Some(&module) = self.modules.get(name) {
            debug!(module = %name, "Module already loaded");
            return Ok(module);
        }
        let image = fs::read(path)?;
        let module = self.load_module(name, &image)?;
        debug!(module = %name, path = %path.display(), bytes = image.len(), "Loaded module");
        Ok(module)
    }

    /// Loads a module image under `name`, replacing any module of that name.
    ///
    /// Kernels resolved from a replaced module are dropped.
    pub fn load_module(&mut self, name: &str, image: &[u8]) -> Result<ModuleHandle> {
        let module = check(
            self.driver.as_ref(),
            "cuModuleLoadData",
            self.driver.module_load_data(image),
        )?;
        if let Some(previous) = self.modules.insert(name.to_string(), module) {
            self.unload(name, previous);
        }
        Ok(module)
    }

    /// Resolves `symbol` in the loaded module `module_name` and records it as
    /// `logical`.
    pub fn register(
        &mut self,
        logical: &str,
        module_name: &str,
        symbol: &str,
    ) -> Result<FunctionHandle> {
        let module = match self.modules.get(module_name) {
            Some(&module) => module,
            None => {
                warn!(module = %module_name, kernel = %logical, "Module not loaded");
                return Err(ComputeError::KernelNotFound(logical.to_string()));
            }
        };
        self.register_in(module, logical, symbol)
    }

    fn register_in(
        &mut self,
        module: ModuleHandle,
        logical: &str,
        symbol: &str,
    ) -> Result<FunctionHandle> {
        let function = match check(
            self.driver.as_ref(),
            "cuModuleGetFunction",
            self.driver.module_get_function(module, symbol),
        ) {
            Ok(function) => function,
            Err(e) => {
                warn!(kernel = %logical, symbol = %symbol, "Kernel not resolved");
                return Err(e);
            }
        };
        self.functions
            .insert(logical.to_string(), (module, function));
        debug!(kernel = %logical, symbol = %symbol, "Registered kernel");
        Ok(function)
    }

    /// Function recorded under `name`.
    pub fn function(&self, name: &str) -> Option<FunctionHandle> {
        self.functions.get(name).map(|&(_, function)| function)
    }

    /// Function recorded under `name`, or [`ComputeError::KernelNotFound`].
    pub fn require(&self, name: &str) -> Result<FunctionHandle> {
        self.function(name)
            .ok_or_else(|| ComputeError::KernelNotFound(name.to_string()))
    }

    /// Module loaded under `name`.
    pub fn module(&self, name: &str) -> Option<ModuleHandle> {
        self.modules.get(name).copied()
    }

    /// Registered logical kernel names, sorted.
    pub fn kernel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no kernels are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    fn unload(&mut self, name: &str, module: ModuleHandle) {
        self.functions.retain(|_, (owner, _)| *owner != module);
        if check(
            self.driver.as_ref(),
            "cuModuleUnload",
            self.driver.module_unload(module),
        )
        .is_ok()
        {
            debug!(module = %name, "Unloaded module");
        }
    }

    /// Unloads every module and forgets every kernel.
    pub fn teardown(&mut self) {
        self.functions.clear();
        let modules: Vec<(String, ModuleHandle)> = self.modules.drain().collect();
        for (name, module) in modules {
            self.unload(&name, module);
        }
    }
}

impl Drop for KernelCatalog {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for KernelCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCatalog")
            .field("modules", &self.modules.len())
            .field("kernels", &self.kernel_names())
            .finish()
    }
}
