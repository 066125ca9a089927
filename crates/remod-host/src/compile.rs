//! The compile cache: source path in, loadable shared object out.
//!
//! Content-addressed and source-based: the cache key is a SHA-256 over the
//! module's root source file plus every source file it references, so an
//! unchanged module never pays a compiler invocation and a changed one
//! always gets a fresh build. The hash is kept in a sidecar file next to
//! the artifact.
//!
//! The compiler itself is behind [`BuildDriver`]; the default
//! [`CommandDriver`] shells out to the configured compiler executable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use remod_api::ModuleInfo;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::CompileError;

#[cfg(target_os = "windows")]
pub const DYLIB_EXT: &str = "dll";
#[cfg(target_os = "macos")]
pub const DYLIB_EXT: &str = "dylib";
#[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
pub const DYLIB_EXT: &str = "so";

// Windows caches loaded DLLs by file name, so every modification needs a
// fresh name there.
const HASH_IN_FILENAME: bool = cfg!(target_os = "windows");

/// Flags handed to the build driver.
pub struct BuildFlags<'a> {
    pub include_dirs: &'a [PathBuf],
    pub rustc_flags: &'a [String],
    pub link_flags: &'a [String],
}

/// The opaque compiler adapter: `build(name, src, dst, flags) → ok`.
pub trait BuildDriver: Send + Sync {
    fn build(
        &self,
        name: &str,
        src: &Path,
        dst: &Path,
        flags: &BuildFlags<'_>,
    ) -> Result<(), CompileError>;
}

/// Default driver: invokes the configured compiler as
/// `<cmd> --crate-type cdylib --crate-name <name> -o <dst> <src> -L <dir>...`.
pub struct CommandDriver {
    program: String,
}

impl CommandDriver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BuildDriver for CommandDriver {
    fn build(
        &self,
        name: &str,
        src: &Path,
        dst: &Path,
        flags: &BuildFlags<'_>,
    ) -> Result<(), CompileError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--crate-type")
            .arg("cdylib")
            .arg("--crate-name")
            .arg(name.replace('-', "_"))
            .arg("-o")
            .arg(dst)
            .arg(src);
        for dir in flags.include_dirs {
            cmd.arg("-L").arg(dir);
        }
        for flag in flags.rustc_flags {
            cmd.arg(flag);
        }
        for flag in flags.link_flags {
            cmd.arg("-C").arg(format!("link-args={flag}"));
        }

        info!(module = name, src = %src.display(), "invoking compiler");
        let output = cmd.output()?;
        if !output.status.success() {
            let log = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(CompileError::Driver {
                status: output.status.to_string(),
                log,
            });
        }
        Ok(())
    }
}

/// Result of a (possibly cached) build.
pub struct BuiltModule {
    /// The shared object to load.
    pub artifact: PathBuf,
    /// Hex content hash the artifact was built from.
    pub hash: String,
    /// Whether the compiler actually ran.
    pub recompiled: bool,
}

/// Source-based, content-addressed build cache.
pub struct CompileCache {
    build_path: PathBuf,
    include_dirs: Vec<PathBuf>,
    skip_compile: BTreeSet<String>,
    driver: Box<dyn BuildDriver>,
}

impl CompileCache {
    pub fn new(
        build_path: PathBuf,
        include_dirs: Vec<PathBuf>,
        skip_compile: BTreeSet<String>,
        driver: Box<dyn BuildDriver>,
    ) -> Self {
        Self {
            build_path,
            include_dirs,
            skip_compile,
            driver,
        }
    }

    /// Resolve the module's root source plus everything it references.
    /// These files feed both the content hash and the file watcher, and
    /// they resolve whether or not the module currently compiles — a
    /// broken module still gets watched so a fixing edit is seen.
    pub fn module_sources(
        &self,
        info: &ModuleInfo,
        extra_include_dirs: &[PathBuf],
    ) -> Result<Vec<PathBuf>, CompileError> {
        let src = info.path.join(format!("{}.rs", info.name));
        if !src.is_file() {
            return Err(CompileError::MissingSource(src));
        }

        let mut include_dirs = self.include_dirs.clone();
        include_dirs.extend_from_slice(extra_include_dirs);

        let mut sources = vec![src.clone()];
        sources.extend(scan_references(&src, &include_dirs)?);
        debug!(module = %info.name, files = sources.len(), "resolved module sources");
        Ok(sources)
    }

    /// Produce a loadable shared object for the module, invoking the
    /// compiler only when the content hash over `sources` differs from
    /// the sidecar. `sources` comes from
    /// [`module_sources`](CompileCache::module_sources).
    pub fn build_module(
        &self,
        info: &ModuleInfo,
        extra_include_dirs: &[PathBuf],
        sources: &[PathBuf],
    ) -> Result<BuiltModule, CompileError> {
        let src = info.path.join(format!("{}.rs", info.name));

        let mut include_dirs = self.include_dirs.clone();
        include_dirs.extend_from_slice(extra_include_dirs);

        let hash = content_hash(sources)?;
        let artifact = self.artifact_path(&info.name, &hash);
        let sidecar = sidecar_path(&artifact);

        let mut skip = self.skip_compile.contains(&info.name);
        if !skip && artifact.is_file() {
            match std::fs::read_to_string(&sidecar) {
                Ok(previous) if previous == hash => {
                    debug!(module = %info.name, "no need to recompile");
                    skip = true;
                }
                _ => {}
            }
        }

        if !skip {
            std::fs::create_dir_all(&self.build_path)?;
            let flags = BuildFlags {
                include_dirs: &include_dirs,
                rustc_flags: &info.meta.rustc_flags,
                link_flags: &info.meta.link_flags,
            };
            self.driver.build(&info.name, &src, &artifact, &flags)?;
            if let Err(e) = std::fs::write(&sidecar, &hash) {
                warn!(module = %info.name, error = %e, "failed to write hash sidecar");
            }
        }

        Ok(BuiltModule {
            artifact,
            hash,
            recompiled: !skip,
        })
    }

    fn artifact_path(&self, name: &str, hash: &str) -> PathBuf {
        let file = if HASH_IN_FILENAME {
            format!("{name}_{hash}.{DYLIB_EXT}")
        } else {
            format!("{name}.{DYLIB_EXT}")
        };
        self.build_path.join(file)
    }
}

fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut s = artifact.as_os_str().to_os_string();
    s.push(".hash");
    PathBuf::from(s)
}

/// SHA-256 over the concatenated bytes of the given files, hex-encoded.
fn content_hash(files: &[PathBuf]) -> Result<String, CompileError> {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(std::fs::read(file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively collect the source files a root file references via
/// `mod name;`, `#[path = "..."]` and `include!("...")`, resolved against
/// the file's own directory and then the include path set.
pub fn scan_references(
    root: &Path,
    include_dirs: &[PathBuf],
) -> Result<Vec<PathBuf>, CompileError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut queue = vec![root.to_path_buf()];
    seen.insert(root.to_path_buf());

    while let Some(file) = queue.pop() {
        let text = std::fs::read_to_string(&file)?;
        let dir = file.parent().unwrap_or(Path::new("."));
        let mut pending_path: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("#[path") {
                pending_path = quoted_value(rest);
                continue;
            }

            let referenced = if let Some(name) = mod_declaration(line) {
                match pending_path.take() {
                    Some(explicit) => resolve_reference(&explicit, dir, include_dirs),
                    None => resolve_module(&name, dir, include_dirs),
                }
            } else if let Some(rest) = line
                .find("include!(")
                .map(|i| &line[i + "include!(".len()..])
            {
                pending_path = None;
                quoted_value(rest).and_then(|p| resolve_reference(&p, dir, include_dirs))
            } else {
                if !line.is_empty() && !line.starts_with("//") {
                    pending_path = None;
                }
                None
            };

            if let Some(path) = referenced {
                if seen.insert(path.clone()) {
                    out.push(path.clone());
                    queue.push(path);
                }
            }
        }
    }

    Ok(out)
}

/// `mod foo;` / `pub mod foo;` → `foo`. Inline `mod foo { .. }` is part of
/// the same file and contributes nothing.
fn mod_declaration(line: &str) -> Option<String> {
    let rest = line.strip_prefix("pub mod ").or_else(|| line.strip_prefix("mod "))?;
    let name = rest.strip_suffix(';')?.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(name.to_string())
}

/// First double-quoted string in `text`.
fn quoted_value(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let end = start + text[start..].find('"')?;
    Some(text[start..end].to_string())
}

fn resolve_module(name: &str, dir: &Path, include_dirs: &[PathBuf]) -> Option<PathBuf> {
    let candidates = [
        dir.join(format!("{name}.rs")),
        dir.join(name).join("mod.rs"),
    ];
    for candidate in candidates {
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for include in include_dirs {
        let candidate = include.join(format!("{name}.rs"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn resolve_reference(path: &str, dir: &Path, include_dirs: &[PathBuf]) -> Option<PathBuf> {
    let relative = dir.join(path);
    if relative.is_file() {
        return Some(relative);
    }
    for include in include_dirs {
        let candidate = include.join(path);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Driver that records invocations and writes a fake artifact.
    struct CountingDriver {
        builds: Arc<AtomicUsize>,
    }

    impl BuildDriver for CountingDriver {
        fn build(
            &self,
            _name: &str,
            src: &Path,
            dst: &Path,
            _flags: &BuildFlags<'_>,
        ) -> Result<(), CompileError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dst, std::fs::read(src)?)?;
            Ok(())
        }
    }

    fn cache_in(dir: &Path) -> (CompileCache, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = CompileCache::new(
            dir.join("build"),
            vec![],
            BTreeSet::new(),
            Box::new(CountingDriver {
                builds: Arc::clone(&builds),
            }),
        );
        (cache, builds)
    }

    #[test]
    fn scan_finds_mod_declarations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("root.rs"),
            "mod helper;\npub mod shapes;\nfn main() {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("helper.rs"), "mod nested;\n").unwrap();
        std::fs::write(dir.path().join("nested.rs"), "// leaf\n").unwrap();
        std::fs::create_dir(dir.path().join("shapes")).unwrap();
        std::fs::write(dir.path().join("shapes").join("mod.rs"), "// shapes\n").unwrap();

        let refs = scan_references(&dir.path().join("root.rs"), &[]).unwrap();
        assert_eq!(refs.len(), 3, "helper, nested, shapes/mod: {refs:?}");
    }

    #[test]
    fn scan_honors_path_attribute_and_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("root.rs"),
            "#[path = \"other_name.rs\"]\nmod helper;\ninclude!(\"snippet.rs\");\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("other_name.rs"), "").unwrap();
        std::fs::write(dir.path().join("snippet.rs"), "").unwrap();

        let refs = scan_references(&dir.path().join("root.rs"), &[]).unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn scan_resolves_against_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::write(shared.join("common.rs"), "").unwrap();
        std::fs::write(dir.path().join("root.rs"), "mod common;\n").unwrap();

        let refs = scan_references(&dir.path().join("root.rs"), &[shared.clone()]).unwrap();
        assert_eq!(refs, vec![shared.join("common.rs")]);
    }

    #[test]
    fn unchanged_sources_skip_the_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("mymod");
        std::fs::create_dir(&module_dir).unwrap();
        std::fs::write(module_dir.join("mymod.rs"), "fn x() {}\n").unwrap();

        let (cache, builds) = cache_in(dir.path());
        let info = ModuleInfo::new("mymod", &module_dir);

        let sources = cache.module_sources(&info, &[]).unwrap();
        let first = cache.build_module(&info, &[], &sources).unwrap();
        assert!(first.recompiled);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let sources = cache.module_sources(&info, &[]).unwrap();
        let second = cache.build_module(&info, &[], &sources).unwrap();
        assert!(!second.recompiled);
        assert_eq!(builds.load(Ordering::SeqCst), 1, "cache hit must skip driver");
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn changed_source_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("mymod");
        std::fs::create_dir(&module_dir).unwrap();
        std::fs::write(module_dir.join("mymod.rs"), "fn x() {}\n").unwrap();

        let (cache, builds) = cache_in(dir.path());
        let info = ModuleInfo::new("mymod", &module_dir);

        let sources = cache.module_sources(&info, &[]).unwrap();
        cache.build_module(&info, &[], &sources).unwrap();
        std::fs::write(module_dir.join("mymod.rs"), "fn y() {}\n").unwrap();
        let sources = cache.module_sources(&info, &[]).unwrap();
        let second = cache.build_module(&info, &[], &sources).unwrap();
        assert!(second.recompiled);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn changed_referenced_file_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("mymod");
        std::fs::create_dir(&module_dir).unwrap();
        std::fs::write(module_dir.join("mymod.rs"), "mod util;\n").unwrap();
        std::fs::write(module_dir.join("util.rs"), "fn a() {}\n").unwrap();

        let (cache, builds) = cache_in(dir.path());
        let info = ModuleInfo::new("mymod", &module_dir);

        let sources = cache.module_sources(&info, &[]).unwrap();
        cache.build_module(&info, &[], &sources).unwrap();
        std::fs::write(module_dir.join("util.rs"), "fn b() {}\n").unwrap();
        let sources = cache.module_sources(&info, &[]).unwrap();
        let second = cache.build_module(&info, &[], &sources).unwrap();
        assert!(second.recompiled);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_in(dir.path());
        let info = ModuleInfo::new("ghost", dir.path());
        assert!(matches!(
            cache.module_sources(&info, &[]),
            Err(CompileError::MissingSource(_))
        ));
    }

    #[test]
    fn skip_compile_bypasses_driver() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("mymod");
        std::fs::create_dir(&module_dir).unwrap();
        std::fs::write(module_dir.join("mymod.rs"), "fn x() {}\n").unwrap();

        let builds = Arc::new(AtomicUsize::new(0));
        let cache = CompileCache::new(
            dir.path().join("build"),
            vec![],
            BTreeSet::from(["mymod".to_string()]),
            Box::new(CountingDriver {
                builds: Arc::clone(&builds),
            }),
        );
        let info = ModuleInfo::new("mymod", &module_dir);
        let sources = cache.module_sources(&info, &[]).unwrap();
        let built = cache.build_module(&info, &[], &sources).unwrap();
        assert!(!built.recompiled);
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }
}
