//! Shared filesystem logic for the replicator and the server
//!
//! Path confinement under the destination root, permission helpers and the
//! sandbox layout the server prepares at startup.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Permission bits carried through the tree model and the wire
pub const MODE_MASK: u32 = 0o777;

/// Normalize a protocol path to be safely under a root directory.
/// This prevents path traversal by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes and empty paths
/// 3. Canonicalizing the deepest existing ancestor to resolve symlinks
/// 4. Ensuring the result is under the root
pub fn normalize_under_root(root: &Path, p: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.contains('\0') {
        return Err(SyncError::PathRejected(format!("{p:?} contains NUL byte")));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(p).components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(SyncError::PathRejected(format!(
                    "{p:?} contains disallowed component {component:?}"
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(SyncError::PathRejected(format!("{p:?} is empty")));
    }

    let canon_root = root
        .canonicalize()
        .map_err(|e| SyncError::access(root, e))?;
    let joined = canon_root.join(&safe);

    // The final component is never resolved: a symlink there is replaced,
    // not followed. Its parent must stay under the root.
    let parent = joined.parent().unwrap_or(&canon_root);
    if parent.exists() {
        let canon_parent = parent
            .canonicalize()
            .map_err(|e| SyncError::access(parent, e))?;
        if !canon_parent.starts_with(&canon_root) {
            return Err(SyncError::PathRejected(format!(
                "{p:?} escapes root {}",
                canon_root.display()
            )));
        }
        if let Some(name) = joined.file_name() {
            return Ok(canon_parent.join(name));
        }
    }
    Ok(joined)
}

/// Permission bits of an entry, masked to rwxrwxrwx
#[cfg(unix)]
pub fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
pub fn mode_of(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o777
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & MODE_MASK))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

/// Create a directory with the given mode if it is missing.
/// An existing non-directory is a type mismatch.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(SyncError::mismatch(path, "directory")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(path).map_err(|e| SyncError::io(path, e))?;
            set_mode(path, mode).map_err(|e| SyncError::io(path, e))?;
            Ok(true)
        }
        Err(e) => Err(SyncError::access(path, e)),
    }
}

/// Layout prepared by the server under its path prefix
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub sandbox: PathBuf,
    pub dest: PathBuf,
}

/// Mode of `PREFIX/sandbox` once prepared: no write bit, so nothing can be
/// created next to `dest`
pub const SANDBOX_MODE: u32 = 0o500;

/// Create `prefix/sandbox/dest` (rwx for the owner) and drop the write bit
/// on `prefix/sandbox`.
pub fn prepare_sandbox(prefix: &Path) -> Result<Sandbox> {
    let sandbox = prefix.join("sandbox");
    let dest = sandbox.join("dest");

    ensure_dir(&sandbox, 0o700)?;
    // Re-runs find the sandbox locked down already
    set_mode(&sandbox, 0o700).map_err(|e| SyncError::io(&sandbox, e))?;
    ensure_dir(&dest, 0o700)?;
    set_mode(&dest, 0o700).map_err(|e| SyncError::io(&dest, e))?;
    set_mode(&sandbox, SANDBOX_MODE).map_err(|e| SyncError::io(&sandbox, e))?;

    Ok(Sandbox { sandbox, dest })
}
