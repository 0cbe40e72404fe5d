//! Resource manager configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable that replaces the kernel directory outright.
pub const KERNEL_DIR_ENV: &str = "HYPERARRAY_KERNEL_DIR";

/// Configuration for [`ResourceManager`](crate::ResourceManager).
///
/// Kernel manifests are searched under
/// `<data_root>/<data_dir>/<kernel_dir>`. An explicit `data_root` always
/// wins; otherwise [`KERNEL_DIR_ENV`] names the whole path, and failing that
/// the root is `$HOME`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Device ordinal to bind.
    pub device_ordinal: i32,
    /// Root of the data tree; `None` defers to the environment.
    pub data_root: Option<PathBuf>,
    /// Data directory below the root.
    pub data_dir: String,
    /// Kernel directory below the data directory.
    pub kernel_dir: String,
    /// Manifest file name searched for recursively.
    pub manifest_name: String,
    /// Extension of module binaries.
    pub binary_extension: String,
    /// Whether to discover kernels at startup.
    pub load_kernels: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            data_root: None,
            data_dir: "hyperarray_data".to_string(),
            kernel_dir: "kernels".to_string(),
            manifest_name: "kernels.lut".to_string(),
            binary_extension: "ptx".to_string(),
            load_kernels: true,
        }
    }
}

impl ComputeConfig {
    /// Creates a builder starting from defaults.
    #[must_use]
    pub fn builder() -> ComputeConfigBuilder {
        ComputeConfigBuilder::default()
    }

    /// Parses TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Kernel directory to search, or `None` when no root can be found.
    pub fn resolve_kernel_dir(&self) -> Option<PathBuf> {
        let override_dir = std::env::var_os(KERNEL_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        let home = std::env::var_os("HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        self.kernel_dir_with(override_dir, home)
    }

    fn kernel_dir_with(
        &self,
        override_dir: Option<PathBuf>,
        home: Option<PathBuf>,
    ) -> Option<PathBuf> {
        let subtree = |root: &Path| root.join(&self.data_dir).join(&self.kernel_dir);
        if let Some(root) = &self.data_root {
            return Some(subtree(root));
        }
        if let Some(dir) = override_dir {
            return Some(dir);
        }
        home.map(|root| subtree(&root))
    }
}

/// Builder for [`ComputeConfig`].
#[derive(Debug, Default)]
pub struct ComputeConfigBuilder {
    config: ComputeConfig,
}

impl ComputeConfigBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the device ordinal.
    #[must_use]
    pub fn with_device_ordinal(mut self, ordinal: i32) -> Self {
        self.config.device_ordinal = ordinal;
        self
    }

    /// Sets the data root.
    #[must_use]
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.data_root = Some(root.into());
        self
    }

    /// Sets the data directory name.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Sets the kernel directory name.
    #[must_use]
    pub fn with_kernel_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.kernel_dir = dir.into();
        self
    }

    /// Sets the manifest file name.
    #[must_use]
    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.config.manifest_name = name.into();
        self
    }

    /// Sets the module binary extension.
    #[must_use]
    pub fn with_binary_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.binary_extension = ext.into();
        self
    }

    /// Enables or disables kernel discovery.
    #[must_use]
    pub fn with_kernel_loading(mut self, enabled: bool) -> Self {
        self.config.load_kernels = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ComputeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;

    #[test]
    fn test_defaults() {
        let config = ComputeConfig::default();
        assert_eq!(config.device_ordinal, 0);
        assert_eq!(config.manifest_name, "kernels.lut");
        assert_eq!(config.binary_extension, "ptx");
        assert!(config.load_kernels);
    }

    #[test]
    fn test_kernel_dir_resolution() {
        let config = ComputeConfig::default();
        assert_eq!(
            config.kernel_dir_with(None, Some(PathBuf::from("/home/ada"))),
            Some(PathBuf::from("/home/ada/hyperarray_data/kernels"))
        );
        assert_eq!(
            config.kernel_dir_with(Some(PathBuf::from("/opt/k")), Some(PathBuf::from("/home/ada"))),
            Some(PathBuf::from("/opt/k"))
        );
        assert_eq!(config.kernel_dir_with(None, None), None);

        let config = ComputeConfig::builder()
            .with_data_root("/data")
            .with_data_dir("sim")
            .with_kernel_dir("ptx")
            .build();
        assert_eq!(
            config.kernel_dir_with(None, None),
            Some(PathBuf::from("/data/sim/ptx"))
        );
        assert_eq!(
            config.kernel_dir_with(Some(PathBuf::from("/opt/k")), Some(PathBuf::from("/home/ada"))),
            Some(PathBuf::from("/data/sim/ptx"))
        );
    }

    #[test]
    fn test_explicit_root_ignores_environment() {
        let root = tempfile::tempdir().unwrap();
        let config = ComputeConfig::builder().with_data_root(root.path()).build();
        assert_eq!(
            config.resolve_kernel_dir(),
            Some(root.path().join("hyperarray_data").join("kernels"))
        );
    }

    #[test]
    fn test_from_toml() {
        let config = ComputeConfig::from_toml_str(
            r#"
            device_ordinal = 1
            manifest_name = "CoreLUT.txt"
            load_kernels = false
            "#,
        )
        .unwrap();
        assert_eq!(config.device_ordinal, 1);
        assert_eq!(config.manifest_name, "CoreLUT.txt");
        assert!(!config.load_kernels);
        assert_eq!(config.kernel_dir, "kernels");

        assert!(matches!(
            ComputeConfig::from_toml_str("device_ordinal = \"zero\""),
            Err(ComputeError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyperarray.toml");
        let config = ComputeConfig::builder()
            .with_binary_extension("cubin")
            .with_data_root(dir.path())
            .build();
        fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(ComputeConfig::from_file(&path).unwrap(), config);
    }
}
