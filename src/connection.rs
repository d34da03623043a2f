//! Server side of one connection: decoder state plus filesystem effects.
//!
//! A `Connection` does no socket I/O. The event loop hands it the bytes a
//! read produced and writes back the replies it returns.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decoder::{Decoder, Event, State};
use crate::error::{Result, SyncError};
use crate::fingerprint::{same_content, Fingerprint};
use crate::protocol::{Status, SyncRequest};
use crate::protocol_core::{ensure_dir, normalize_under_root, set_mode};

/// Destination paths with a DataTransfer in flight. A second writer for
/// the same path is refused.
#[derive(Clone, Default)]
pub struct PathLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, path: &Path) -> Option<PathGuard> {
        let mut held = self.held.lock();
        if !held.insert(path.to_path_buf()) {
            return None;
        }
        Some(PathGuard {
            held: Arc::clone(&self.held),
            path: path.to_path_buf(),
        })
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }
}

/// Releases its path on drop
pub struct PathGuard {
    held: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.path);
    }
}

struct Transfer {
    path: PathBuf,
    mode: u32,
    expected: u64,
    written: u64,
    writer: BufWriter<File>,
    _guard: PathGuard,
}

/// What the caller must do after feeding bytes
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Replies to write back, in order
    pub replies: Vec<Status>,
    /// The connection is done and must be closed after the replies
    pub close: bool,
}

pub struct Connection {
    id: u64,
    root: PathBuf,
    decoder: Decoder,
    locks: PathLocks,
    transfer: Option<Transfer>,
    /// Directories loosened for population, restored when the session ends
    pending_modes: Vec<(PathBuf, u32)>,
}

impl Connection {
    pub fn new(id: u64, root: PathBuf, locks: PathLocks) -> Self {
        Self {
            id,
            root,
            decoder: Decoder::new(),
            locks,
            transfer: None,
            pending_modes: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.decoder.state()
    }

    /// Decode `bytes` and apply every completed request.
    /// A decode error means the peer broke framing; drop the connection.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Step> {
        let mut step = Step::default();
        for event in self.decoder.feed(bytes)? {
            match event {
                Event::Directory(req) => step.replies.push(self.handle_directory(&req)),
                Event::File(req) => step.replies.push(self.handle_file(&req)),
                Event::TransferStart(req) => {
                    if let Err(e) = self.open_transfer(&req) {
                        tracing::warn!(conn = self.id, path = %req.path, error = %e, "transfer refused");
                        step.replies.push(Status::Error);
                        step.close = true;
                        return Ok(step);
                    }
                }
                Event::Data(chunk) => {
                    if let Err(e) = self.write_chunk(&chunk) {
                        tracing::warn!(conn = self.id, error = %e, "transfer write failed");
                        self.transfer = None;
                        step.replies.push(Status::Error);
                        step.close = true;
                        return Ok(step);
                    }
                }
                Event::TransferComplete => {
                    let status = match self.complete_transfer() {
                        Ok(()) => Status::Ok,
                        Err(e) => {
                            tracing::warn!(conn = self.id, error = %e, "transfer finalize failed");
                            Status::Error
                        }
                    };
                    step.replies.push(status);
                    step.close = true;
                    return Ok(step);
                }
            }
        }
        Ok(step)
    }

    /// Session teardown. Restores deferred directory modes (deepest first)
    /// and reports a transfer cut short by the peer. Bytes already received
    /// stay on disk; no success is signalled for them.
    pub fn finish(&mut self) -> Option<SyncError> {
        let mut pending = std::mem::take(&mut self.pending_modes);
        pending.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in pending {
            if let Err(e) = set_mode(&path, mode) {
                tracing::warn!(conn = self.id, path = %path.display(), error = %e, "cannot restore directory mode");
            }
        }

        let transfer = self.transfer.take()?;
        let Transfer {
            path,
            expected,
            written,
            mut writer,
            ..
        } = transfer;
        if let Err(e) = writer.flush() {
            tracing::warn!(conn = self.id, path = %path.display(), error = %e, "flush of partial transfer failed");
        }
        Some(SyncError::ProtocolDisconnect(format!(
            "{} received {written} of {expected} bytes",
            path.display()
        )))
    }

    fn resolve(&self, req: &SyncRequest) -> Result<PathBuf> {
        normalize_under_root(&self.root, &req.path)
    }

    fn handle_directory(&mut self, req: &SyncRequest) -> Status {
        match self.reconcile_directory(req) {
            Ok(()) => Status::Ok,
            Err(e) => {
                tracing::warn!(conn = self.id, path = %req.path, error = %e, "directory failed");
                status_for(&e)
            }
        }
    }

    fn reconcile_directory(&mut self, req: &SyncRequest) -> Result<()> {
        let path = self.resolve(req)?;
        let populate = req.mode | 0o700;
        if ensure_dir(&path, populate)? {
            tracing::debug!(conn = self.id, path = %path.display(), "created directory");
        }
        set_mode(&path, populate).map_err(|e| SyncError::io(&path, e))?;
        if populate != req.mode {
            self.pending_modes.push((path, req.mode));
        }
        Ok(())
    }

    fn handle_file(&self, req: &SyncRequest) -> Status {
        match self.compare_file(req) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(conn = self.id, path = %req.path, error = %e, "file check failed");
                status_for(&e)
            }
        }
    }

    fn compare_file(&self, req: &SyncRequest) -> Result<Status> {
        let path = self.resolve(req)?;
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Status::SendFile),
            Err(e) => return Err(SyncError::access(&path, e)),
        };
        if meta.is_dir() || meta.file_type().is_symlink() {
            return Err(SyncError::mismatch(&path, "file"));
        }

        let size = req.size as u64;
        if meta.len() != size {
            return Ok(Status::SendFile);
        }
        let local = match Fingerprint::of_file(&path) {
            Ok(fp) => fp,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                set_mode(&path, req.mode | 0o600).map_err(|e| SyncError::io(&path, e))?;
                Fingerprint::of_file(&path).map_err(|e| SyncError::io(&path, e))?
            }
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        let remote = req
            .fingerprint
            .as_ref()
            .ok_or_else(|| SyncError::Protocol("file message without fingerprint".into()))?;

        if same_content(size, remote, meta.len(), &local) {
            set_mode(&path, req.mode).map_err(|e| SyncError::io(&path, e))?;
            Ok(Status::Ok)
        } else {
            Ok(Status::SendFile)
        }
    }

    fn open_transfer(&mut self, req: &SyncRequest) -> Result<()> {
        let path = self.resolve(req)?;
        let guard = self
            .locks
            .try_lock(&path)
            .ok_or_else(|| SyncError::Busy(path.clone()))?;
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() || meta.file_type().is_symlink() => {
                return Err(SyncError::mismatch(&path, "file"));
            }
            Ok(_) => {
                set_mode(&path, req.mode | 0o600).map_err(|e| SyncError::io(&path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::access(&path, e)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SyncError::io(&path, e))?;

        tracing::debug!(conn = self.id, path = %path.display(), size = req.size, "receiving file");
        self.transfer = Some(Transfer {
            path,
            mode: req.mode,
            expected: req.size as u64,
            written: 0,
            writer: BufWriter::with_capacity(64 * 1024, file),
            _guard: guard,
        });
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let transfer = self
            .transfer
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("data without an open transfer".into()))?;
        transfer
            .writer
            .write_all(chunk)
            .map_err(|e| SyncError::io(&transfer.path, e))?;
        transfer.written += chunk.len() as u64;
        Ok(())
    }

    fn complete_transfer(&mut self) -> Result<()> {
        let mut transfer = self
            .transfer
            .take()
            .ok_or_else(|| SyncError::Protocol("transfer completed twice".into()))?;
        transfer
            .writer
            .flush()
            .map_err(|e| SyncError::io(&transfer.path, e))?;
        set_mode(&transfer.path, transfer.mode).map_err(|e| SyncError::io(&transfer.path, e))?;
        tracing::info!(
            conn = self.id,
            path = %transfer.path.display(),
            bytes = transfer.written,
            "file received"
        );
        Ok(())
    }
}

fn status_for(error: &SyncError) -> Status {
    if error.is_type_mismatch() {
        Status::Mismatch
    } else {
        Status::Error
    }
}
