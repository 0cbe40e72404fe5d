//! Kernel manifest parsing.
//!
//! A manifest is line oriented. Each trimmed, non-blank line is one of:
//!
//! ```text
//! <module> <expected_kernel_count>     opens a module block
//! <logical_name>:<symbol>              binds a kernel in the open module
//! ```
//!
//! Parsing is pure; loading modules and resolving symbols happens in
//! [`KernelCatalog`](super::KernelCatalog).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ComputeError, Result};

/// One manifest record, tagged with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    /// Start of a module block.
    Module {
        /// Line number.
        line: usize,
        /// Module name; the binary is `<name>.<ext>`.
        name: String,
        /// Number of kernels the block declares.
        expected: usize,
    },
    /// Logical kernel name bound to a symbol in the open module.
    Kernel {
        /// Line number.
        line: usize,
        /// Name callers launch by.
        logical: String,
        /// Entry point symbol in the module binary.
        symbol: String,
    },
    /// A line matching neither form.
    Malformed {
        /// Line number.
        line: usize,
        /// Trimmed line text.
        text: String,
    },
}

impl ManifestEntry {
    /// Line number of the record.
    pub fn line(&self) -> usize {
        match self {
            ManifestEntry::Module { line, .. }
            | ManifestEntry::Kernel { line, .. }
            | ManifestEntry::Malformed { line, .. } => *line,
        }
    }

    fn parse_line(line: usize, text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some((logical, symbol)) = text.split_once(':') {
            let (logical, symbol) = (logical.trim(), symbol.trim());
            if logical.is_empty() || symbol.is_empty() || symbol.contains(':') {
                return Some(Self::malformed(line, text));
            }
            return Some(ManifestEntry::Kernel {
                line,
                logical: logical.to_string(),
                symbol: symbol.to_string(),
            });
        }

        let mut tokens = text.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(name), Some(count), None) => match count.parse() {
                Ok(expected) => Some(ManifestEntry::Module {
                    line,
                    name: name.to_string(),
                    expected,
                }),
                Err(_) => Some(Self::malformed(line, text)),
            },
            _ => Some(Self::malformed(line, text)),
        }
    }

    fn malformed(line: usize, text: &str) -> Self {
        ManifestEntry::Malformed {
            line,
            text: text.to_string(),
        }
    }
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    path: Option<PathBuf>,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse manifest text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(i, line)| ManifestEntry::parse_line(i + 1, line))
            .collect();
        Self {
            path: None,
            entries,
        }
    }

    /// Read and parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ComputeError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut manifest = Self::parse(&text);
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// File the manifest was read from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Directory module binaries resolve against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// Records in file order.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Number of module blocks.
    pub fn module_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ManifestEntry::Module { .. }))
            .count()
    }
}
