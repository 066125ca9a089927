//! Module descriptions: what the host knows about a module before and
//! after loading it.

use std::path::PathBuf;

/// A declared dependency on another module. Used by the access policy:
/// if A declares a dependency on B, B may never synchronously call A.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDependency {
    pub module: String,
    pub optional: bool,
}

impl ModuleDependency {
    pub fn on(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            optional: false,
        }
    }
}

/// Build- and policy-relevant metadata of a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleMeta {
    pub dependencies: Vec<ModuleDependency>,
    /// Extra compiler flags passed through to the build driver.
    pub rustc_flags: Vec<String>,
    /// Extra linker flags passed through to the build driver.
    pub link_flags: Vec<String>,
    /// Skip native compilation entirely; the module has no compiled part.
    pub disable_native_build: bool,
}

/// Descriptive record of a module known to the host. Immutable once
/// stored; updated only by replacing the entry.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Unique module name. Also names the source file (`<name>.rs`) and
    /// the factory symbol (`create_module_<name>`).
    pub name: String,
    /// Source directory.
    pub path: PathBuf,
    pub meta: ModuleMeta,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            meta: ModuleMeta::default(),
        }
    }
}
