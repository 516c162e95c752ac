//! Loading modules and resolving entry points for `invoke_method`.
//!
//! Two kinds of modules exist:
//!
//! - `@builtin`: entry points compiled into the host binary and registered
//!   with [`inventory::submit!`] as [`BuiltinEntry`] values.
//! - Native dynamic libraries. An entry point `<container>.<name>` resolves
//!   to the exported symbol `<container>_<name>` (dots in the container
//!   become underscores) with the C signature
//!   `int entry(int argc, const char **argv)`.
//!
//! A native module's dependencies resolve from its own directory first.
//! Windows does this with an altered search path; on Unix the shared
//! objects next to the module are loaded locally before it, so the
//! dynamic linker matches them by soname.

use std::ffi::{CString, c_char, c_int};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use libloading::Library;

use isolite_shared::{FaultKind, RemoteFault};

/// Module path addressing the host's built-in entry points.
pub const BUILTIN_MODULE: &str = "@builtin";

/// Signature of a built-in entry point. A panic is the entry point's fault.
pub type EntryFn = fn(&[String]) -> i32;

type NativeEntryFn = unsafe extern "C-unwind" fn(c_int, *const *const c_char) -> c_int;

/// An entry point compiled into the host.
pub struct BuiltinEntry {
    pub container: &'static str,
    pub name: &'static str,
    pub func: EntryFn,
}

impl BuiltinEntry {
    pub const fn new(container: &'static str, name: &'static str, func: EntryFn) -> Self {
        Self {
            container,
            name,
            func,
        }
    }
}

inventory::collect!(BuiltinEntry);

/// A loaded module.
pub trait CodeModule: Send + Sync {
    fn path(&self) -> &str;

    fn resolve(&self, container: &str, name: &str) -> Result<EntryPoint, RemoteFault>;
}

/// A resolved entry point, ready to invoke.
pub enum EntryPoint {
    Builtin(EntryFn),
    Native {
        func: NativeEntryFn,
        // Keeps the code mapped while the entry point is alive.
        _library: Arc<LoadedLibrary>,
    },
}

impl EntryPoint {
    /// Runs the entry point. Its faults come back as [`FaultKind::Workload`].
    pub fn invoke(&self, args: &[String]) -> Result<i32, RemoteFault> {
        match self {
            EntryPoint::Builtin(func) => {
                catch_unwind(AssertUnwindSafe(|| func(args))).map_err(workload_fault)
            }
            EntryPoint::Native { func, .. } => {
                let owned = args
                    .iter()
                    .map(|arg| CString::new(arg.as_str()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        RemoteFault::new(
                            FaultKind::InvalidParameter,
                            format!("argument contains a NUL byte: {}", e),
                        )
                    })?;
                let mut argv: Vec<*const c_char> = owned.iter().map(|a| a.as_ptr()).collect();
                argv.push(std::ptr::null());
                let argc = c_int::try_from(owned.len()).map_err(|_| {
                    RemoteFault::new(FaultKind::InvalidParameter, "too many arguments")
                })?;

                // SAFETY: argv holds argc valid C strings followed by NULL and
                // outlives the call. The symbol was resolved with this signature.
                catch_unwind(AssertUnwindSafe(|| unsafe { func(argc, argv.as_ptr()) }))
                    .map_err(workload_fault)
            }
        }
    }
}

fn workload_fault(payload: Box<dyn std::any::Any + Send>) -> RemoteFault {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "entry point failed".to_string()
    };
    RemoteFault::new(FaultKind::Workload, message)
}

/// Loads modules by path.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeHost;

impl CodeHost {
    pub fn new() -> Self {
        Self
    }

    /// Loads the module at `path`.
    ///
    /// Loading a path that is already loaded shares the OS's
    /// reference-counted handle; the module is unloaded with its last user.
    pub fn load(&self, path: &str) -> Result<Box<dyn CodeModule>, RemoteFault> {
        if path == BUILTIN_MODULE {
            return Ok(Box::new(BuiltinModule));
        }
        if path.trim().is_empty() {
            return Err(RemoteFault::new(
                FaultKind::InvalidParameter,
                "module path is empty",
            ));
        }

        let library = open_library(Path::new(path)).map_err(|e| {
            RemoteFault::new(
                FaultKind::ModuleLoad,
                format!("failed to load module '{}': {}", path, e),
            )
        })?;
        Ok(Box::new(NativeModule {
            path: path.to_string(),
            library: Arc::new(library),
        }))
    }
}

/// A module together with the libraries loaded on its behalf.
pub struct LoadedLibrary {
    // Declared first so the module unloads before its dependencies.
    library: Library,
    _dependencies: Vec<Library>,
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<LoadedLibrary, libloading::Error> {
    let dependencies = preload_siblings(path);
    let library = open_local(path)?;
    Ok(LoadedLibrary {
        library,
        _dependencies: dependencies,
    })
}

#[cfg(unix)]
fn open_local(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    // SAFETY: loading runs the library's initializers; the caller chose the module.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Library::from)
}

/// Loads the shared objects next to `module`. Siblings that need another
/// sibling are retried until a pass makes no progress.
#[cfg(unix)]
fn preload_siblings(module: &Path) -> Vec<Library> {
    let mut pending = sibling_libraries(module);
    let mut loaded = Vec::new();

    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|candidate| match open_local(candidate) {
            Ok(library) => {
                loaded.push(library);
                false
            }
            Err(_) => true,
        });
        if pending.len() == before {
            break;
        }
    }

    for skipped in &pending {
        tracing::debug!(module = %module.display(), library = %skipped.display(), "Skipped module dependency");
    }
    loaded
}

/// Shared objects in the directory of `module`, excluding the module itself.
#[cfg(unix)]
fn sibling_libraries(module: &Path) -> Vec<PathBuf> {
    let Some(dir) = module.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let module_name = module.file_name();
    let mut siblings: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.file_name() != module_name)
        .filter(|path| is_shared_object(path))
        .collect();
    siblings.sort();
    siblings
}

#[cfg(unix)]
fn is_shared_object(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.ends_with(".so") || name.contains(".so.") || name.ends_with(".dylib")
}

#[cfg(windows)]
fn open_library(path: &Path) -> Result<LoadedLibrary, libloading::Error> {
    use libloading::os::windows::{LOAD_WITH_ALTERED_SEARCH_PATH, Library as WindowsLibrary};

    // SAFETY: loading runs DllMain; the caller chose the module.
    let library = unsafe { WindowsLibrary::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH) }
        .map(Library::from)?;
    Ok(LoadedLibrary {
        library,
        _dependencies: Vec::new(),
    })
}

struct BuiltinModule;

impl CodeModule for BuiltinModule {
    fn path(&self) -> &str {
        BUILTIN_MODULE
    }

    fn resolve(&self, container: &str, name: &str) -> Result<EntryPoint, RemoteFault> {
        let mut container_found = false;
        for entry in inventory::iter::<BuiltinEntry> {
            if entry.container != container {
                continue;
            }
            container_found = true;
            if entry.name == name {
                return Ok(EntryPoint::Builtin(entry.func));
            }
        }

        if container_found {
            Err(entry_point_not_found(BUILTIN_MODULE, container, name))
        } else {
            Err(RemoteFault::new(
                FaultKind::ContainerNotFound,
                format!("container '{}' not found in {}", container, BUILTIN_MODULE),
            ))
        }
    }
}

struct NativeModule {
    path: String,
    library: Arc<LoadedLibrary>,
}

impl CodeModule for NativeModule {
    fn path(&self) -> &str {
        &self.path
    }

    fn resolve(&self, container: &str, name: &str) -> Result<EntryPoint, RemoteFault> {
        let symbol = native_symbol(container, name);
        // SAFETY: exported entry points must have the NativeEntryFn signature.
        let func = unsafe { self.library.library.get::<NativeEntryFn>(symbol.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|_| entry_point_not_found(&self.path, container, name))?;
        Ok(EntryPoint::Native {
            func,
            _library: Arc::clone(&self.library),
        })
    }
}

fn native_symbol(container: &str, name: &str) -> String {
    format!("{}_{}", container.replace('.', "_"), name)
}

fn entry_point_not_found(path: &str, container: &str, name: &str) -> RemoteFault {
    RemoteFault::new(
        FaultKind::EntryPointNotFound,
        format!(
            "entry point '{}.{}' with signature fn(&[String]) -> i32 not found in {}",
            container, name, path
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_count(args: &[String]) -> i32 {
        args.len() as i32
    }

    fn explode(_: &[String]) -> i32 {
        panic!("exploded");
    }

    inventory::submit!(BuiltinEntry::new("test.code_host", "count", echo_count));
    inventory::submit!(BuiltinEntry::new("test.code_host", "explode", explode));

    #[test]
    fn test_builtin_resolution() {
        let module = CodeHost::new().load(BUILTIN_MODULE).unwrap();
        let entry = module.resolve("test.code_host", "count").unwrap();
        assert_eq!(entry.invoke(&["a".into(), "b".into()]).unwrap(), 2);

        let missing = module.resolve("test.code_host", "nothing").err().unwrap();
        assert_eq!(missing.kind, FaultKind::EntryPointNotFound);

        let missing = module.resolve("no.such", "count").err().unwrap();
        assert_eq!(missing.kind, FaultKind::ContainerNotFound);
    }

    #[test]
    fn test_panic_becomes_workload_fault() {
        let module = CodeHost::new().load(BUILTIN_MODULE).unwrap();
        let fault = module
            .resolve("test.code_host", "explode")
            .unwrap()
            .invoke(&[])
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Workload);
        assert_eq!(fault.message, "exploded");
    }

    #[test]
    fn test_missing_library_is_module_load_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-module.so");
        let fault = CodeHost::new()
            .load(&path.to_string_lossy())
            .err()
            .unwrap();
        assert_eq!(fault.kind, FaultKind::ModuleLoad);
    }

    #[cfg(unix)]
    #[test]
    fn test_sibling_libraries_exclude_module_and_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["module.so", "libdep.so", "libversioned.so.1", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.so")).unwrap();

        let siblings = sibling_libraries(&dir.path().join("module.so"));
        assert_eq!(
            siblings,
            vec![dir.path().join("libdep.so"), dir.path().join("libversioned.so.1")]
        );
        assert!(sibling_libraries(Path::new("module.so")).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unloadable_siblings_do_not_block_module_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libjunk.so"), b"not a library").unwrap();
        std::fs::write(dir.path().join("module.so"), b"not a library either").unwrap();

        assert!(preload_siblings(&dir.path().join("module.so")).is_empty());
        let fault = CodeHost::new()
            .load(&dir.path().join("module.so").to_string_lossy())
            .err()
            .unwrap();
        assert_eq!(fault.kind, FaultKind::ModuleLoad);
    }

    #[test]
    fn test_native_symbol_name() {
        assert_eq!(native_symbol("acme.tools", "run"), "acme_tools_run");
    }
}
