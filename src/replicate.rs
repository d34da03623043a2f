//! Local tree replication
//!
//! Copies a source tree into a destination root, merging with whatever is
//! already there. Each subdirectory is handed to a worker on a bounded rayon
//! pool; a directory restores its own permission bits only after all of its
//! children have reported back.

use crate::error::SyncError;
use crate::fingerprint::{same_content, Fingerprint};
use crate::logger::Logger;
use crate::protocol_core::{ensure_dir, mode_of, set_mode};
use crate::tree::is_hidden;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

/// Permissions a directory holds while it is being populated
const POPULATE_MODE: u32 = 0o777;

#[derive(Debug, Clone, Default)]
pub struct ReplicateOptions {
    /// Worker threads (0 = one per CPU)
    pub threads: usize,
}

impl ReplicateOptions {
    pub fn worker_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }
}

/// Aggregate result of a replication, merged up through the worker tree
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationOutcome {
    pub succeeded: bool,
    pub failed_units: u64,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub bytes_copied: u64,
    pub dirs_created: u64,
    pub errors: Vec<String>,
}

impl Default for ReplicationOutcome {
    fn default() -> Self {
        Self {
            succeeded: true,
            failed_units: 0,
            files_copied: 0,
            files_skipped: 0,
            bytes_copied: 0,
            dirs_created: 0,
            errors: Vec::new(),
        }
    }
}

impl ReplicationOutcome {
    pub fn add_file(&mut self, bytes: u64) {
        self.files_copied += 1;
        self.bytes_copied += bytes;
    }

    pub fn fail(&mut self, error: SyncError, logger: &dyn Logger) {
        let path = error_path(&error);
        logger.error("replicate", &path, &error.to_string());
        self.succeeded = false;
        self.failed_units += 1;
        self.errors.push(error.to_string());
    }

    pub fn merge(&mut self, other: ReplicationOutcome) {
        self.succeeded &= other.succeeded;
        self.failed_units += other.failed_units;
        self.files_copied += other.files_copied;
        self.files_skipped += other.files_skipped;
        self.bytes_copied += other.bytes_copied;
        self.dirs_created += other.dirs_created;
        self.errors.extend(other.errors);
    }

    fn merged(mut self, other: ReplicationOutcome) -> Self {
        self.merge(other);
        self
    }

    /// Collapse into a single error when anything failed
    pub fn into_result(self, root: &Path) -> Result<Self, SyncError> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(SyncError::TransferFailure {
                path: root.to_path_buf(),
                failed: self.failed_units,
            })
        }
    }
}

fn error_path(error: &SyncError) -> PathBuf {
    match error {
        SyncError::Access { path, .. }
        | SyncError::Io { path, .. }
        | SyncError::TypeMismatch { path, .. }
        | SyncError::TransferFailure { path, .. }
        | SyncError::Busy(path) => path.clone(),
        _ => PathBuf::new(),
    }
}

/// Replicate `source` into `dest_root`, under the source's own name
pub fn replicate(
    source: &Path,
    dest_root: &Path,
    options: &ReplicateOptions,
    logger: &dyn Logger,
) -> ReplicationOutcome {
    let started = Instant::now();
    let mut outcome = ReplicationOutcome::default();

    match fs::metadata(dest_root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            outcome.fail(SyncError::mismatch(dest_root, "directory"), logger);
            return outcome;
        }
        Err(e) => {
            outcome.fail(SyncError::access(dest_root, e), logger);
            return outcome;
        }
    }

    let name = match source_name(source) {
        Ok(name) => name,
        Err(e) => {
            outcome.fail(e, logger);
            return outcome;
        }
    };
    let target = dest_root.join(name);

    let result = match rayon::ThreadPoolBuilder::new()
        .num_threads(options.worker_count())
        .build()
    {
        Ok(pool) => pool.install(|| replicate_entry(source, &target, logger)),
        Err(e) => {
            tracing::warn!(error = %e, "worker pool unavailable, replicating on this thread");
            replicate_entry(source, &target, logger)
        }
    };
    outcome.merge(result);

    logger.done(
        outcome.files_copied + outcome.files_skipped + outcome.dirs_created,
        outcome.failed_units,
        outcome.bytes_copied,
        started.elapsed().as_secs_f64(),
    );
    outcome
}

/// Final component of `source`, resolving `.` and `..` through the filesystem
pub fn source_name(source: &Path) -> Result<String, SyncError> {
    if let Some(name) = source.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let canonical = source
        .canonicalize()
        .map_err(|e| SyncError::access(source, e))?;
    canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SyncError::access(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"),
            )
        })
}

fn replicate_entry(src: &Path, dst: &Path, logger: &dyn Logger) -> ReplicationOutcome {
    let mut outcome = ReplicationOutcome::default();
    let meta = match fs::symlink_metadata(src) {
        Ok(meta) => meta,
        Err(e) => {
            outcome.fail(SyncError::access(src, e), logger);
            return outcome;
        }
    };

    if meta.is_dir() {
        return replicate_dir(src, dst, mode_of(&meta), logger);
    }

    // Links are copied as the file they point to; anything else is skipped
    let meta = if meta.file_type().is_symlink() {
        match fs::metadata(src) {
            Ok(target) if target.is_file() => target,
            _ => {
                tracing::debug!(path = %src.display(), "skipping link to non-file");
                return outcome;
            }
        }
    } else {
        meta
    };
    if !meta.is_file() {
        tracing::debug!(path = %src.display(), "skipping special file");
        return outcome;
    }

    match replicate_file(src, dst, &meta, logger) {
        Ok(FileAction::Copied(bytes)) => {
            logger.copy_done(src, dst, bytes);
            outcome.add_file(bytes);
        }
        Ok(FileAction::Skipped) => {
            logger.skipped(src, dst);
            outcome.files_skipped += 1;
        }
        Err(e) => outcome.fail(e, logger),
    }
    outcome
}

fn replicate_dir(src: &Path, dst: &Path, mode: u32, logger: &dyn Logger) -> ReplicationOutcome {
    let mut outcome = ReplicationOutcome::default();

    match ensure_dir(dst, POPULATE_MODE) {
        Ok(true) => outcome.dirs_created += 1,
        Ok(false) => {}
        Err(e) => {
            outcome.fail(e, logger);
            return outcome;
        }
    }
    if let Err(e) = set_mode(dst, POPULATE_MODE) {
        outcome.fail(SyncError::io(dst, e), logger);
        return outcome;
    }

    let mut subdirs = Vec::new();
    if let Err(e) = fs::read_dir(src) {
        outcome.fail(SyncError::access(src, e), logger);
    } else {
        for entry in WalkDir::new(src).min_depth(1).max_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(src).to_path_buf();
                    outcome.fail(SyncError::access(path, e.into()), logger);
                    continue;
                }
            };
            let name = entry.file_name();
            if is_hidden(&name.to_string_lossy()) {
                continue;
            }
            let child_dst = dst.join(name);
            if entry.file_type().is_dir() {
                subdirs.push((entry.into_path(), child_dst));
            } else {
                outcome.merge(replicate_entry(entry.path(), &child_dst, logger));
            }
        }
    }

    // One worker per subdirectory; the reduce is the join barrier
    let children = subdirs
        .par_iter()
        .map(|(child_src, child_dst)| replicate_entry(child_src, child_dst, logger))
        .reduce(ReplicationOutcome::default, ReplicationOutcome::merged);
    outcome.merge(children);

    if let Err(e) = set_mode(dst, mode) {
        outcome.fail(SyncError::io(dst, e), logger);
    }
    outcome
}

enum FileAction {
    Copied(u64),
    Skipped,
}

fn replicate_file(
    src: &Path,
    dst: &Path,
    src_meta: &Metadata,
    logger: &dyn Logger,
) -> Result<FileAction, SyncError> {
    let mode = mode_of(src_meta);
    logger.start(src, dst);

    match fs::symlink_metadata(dst) {
        Ok(dst_meta) if dst_meta.is_dir() || dst_meta.file_type().is_symlink() => {
            return Err(SyncError::mismatch(dst, "file"));
        }
        Ok(dst_meta) => {
            if dst_meta.len() == src_meta.len() && contents_match(src, dst, src_meta.len())? {
                set_mode(dst, mode).map_err(|e| SyncError::io(dst, e))?;
                return Ok(FileAction::Skipped);
            }
            // Existing file may be read-only
            set_mode(dst, mode | 0o600).map_err(|e| SyncError::io(dst, e))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::access(dst, e)),
    }

    let bytes = copy_bytes(src, dst)?;
    set_mode(dst, mode).map_err(|e| SyncError::io(dst, e))?;
    Ok(FileAction::Copied(bytes))
}

/// Fingerprint comparison for two files already known to have equal size
fn contents_match(src: &Path, dst: &Path, size: u64) -> Result<bool, SyncError> {
    let src_fp = Fingerprint::of_file(src).map_err(|e| SyncError::io(src, e))?;
    let dst_fp = match Fingerprint::of_file(dst) {
        Ok(fp) => fp,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            set_mode(dst, 0o600).map_err(|e| SyncError::io(dst, e))?;
            Fingerprint::of_file(dst).map_err(|e| SyncError::io(dst, e))?
        }
        Err(e) => return Err(SyncError::io(dst, e)),
    };
    Ok(same_content(size, &src_fp, size, &dst_fp))
}

fn copy_bytes(src: &Path, dst: &Path) -> Result<u64, SyncError> {
    let reader = File::open(src).map_err(|e| SyncError::io(src, e))?;
    let writer = File::create(dst).map_err(|e| SyncError::io(dst, e))?;
    let mut reader = BufReader::with_capacity(64 * 1024, reader);
    let mut writer = BufWriter::with_capacity(64 * 1024, writer);
    let bytes = io::copy(&mut reader, &mut writer).map_err(|e| SyncError::io(dst, e))?;
    writer.flush().map_err(|e| SyncError::io(dst, e))?;
    Ok(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::tree::{build, isomorphic};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        src: PathBuf,
        dest: PathBuf,
    }

    /// root/{a.txt (644, "hi"), sub/b.txt (600, "bye")}
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("root");
        let dest = tmp.path().join("dest");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(src.join("a.txt"), "hi").unwrap();
        fs::write(src.join("sub/b.txt"), "bye").unwrap();
        set_mode(&src.join("a.txt"), 0o644).unwrap();
        set_mode(&src.join("sub/b.txt"), 0o600).unwrap();
        set_mode(&src.join("sub"), 0o750).unwrap();
        set_mode(&src, 0o755).unwrap();
        Fixture {
            _tmp: tmp,
            src,
            dest,
        }
    }

    fn run(fx: &Fixture) -> ReplicationOutcome {
        replicate(&fx.src, &fx.dest, &ReplicateOptions { threads: 2 }, &NoopLogger)
    }

    #[test]
    fn test_round_trip_is_isomorphic() {
        let fx = fixture();
        let outcome = run(&fx);
        assert!(outcome.succeeded, "{:?}", outcome.errors);
        assert_eq!(outcome.files_copied, 2);
        assert_eq!(outcome.dirs_created, 2);

        let src_tree = build(&fx.src).unwrap();
        let dst_tree = build(&fx.dest.join("root")).unwrap();
        assert!(isomorphic(&src_tree, &dst_tree));
        assert_eq!(fs::read(fx.dest.join("root/sub/b.txt")).unwrap(), b"bye");
    }

    #[test]
    fn test_second_run_copies_nothing_but_fixes_modes() {
        let fx = fixture();
        assert!(run(&fx).succeeded);

        set_mode(&fx.src.join("a.txt"), 0o600).unwrap();
        let outcome = run(&fx);
        assert!(outcome.succeeded);
        assert_eq!(outcome.files_copied, 0);
        assert_eq!(outcome.files_skipped, 2);

        let meta = fs::metadata(fx.dest.join("root/a.txt")).unwrap();
        assert_eq!(mode_of(&meta), 0o600);
    }

    #[test]
    fn test_zero_fold_file_is_not_recopied() {
        let fx = fixture();
        // Folds to an all-zero fingerprint
        fs::write(fx.src.join("z.txt"), "aaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(run(&fx).files_copied, 3);

        let outcome = run(&fx);
        assert!(outcome.succeeded, "{:?}", outcome.errors);
        assert_eq!(outcome.files_copied, 0);
        assert_eq!(outcome.files_skipped, 3);
    }

    #[test]
    fn test_changed_file_is_recopied() {
        let fx = fixture();
        assert!(run(&fx).succeeded);

        fs::write(fx.src.join("a.txt"), "hey").unwrap();
        let outcome = run(&fx);
        assert!(outcome.succeeded);
        assert_eq!(outcome.files_copied, 1);
        assert_eq!(outcome.files_skipped, 1);
        assert_eq!(fs::read(fx.dest.join("root/a.txt")).unwrap(), b"hey");
    }

    #[test]
    fn test_type_mismatch_spares_siblings() {
        let fx = fixture();
        // a.txt is a directory on the destination side
        fs::create_dir_all(fx.dest.join("root/a.txt/keep")).unwrap();

        let outcome = run(&fx);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failed_units, 1);
        assert!(fx.dest.join("root/a.txt/keep").is_dir());
        assert_eq!(fs::read(fx.dest.join("root/sub/b.txt")).unwrap(), b"bye");
    }

    #[test]
    fn test_directory_onto_file_mismatch() {
        let fx = fixture();
        fs::create_dir(fx.dest.join("root")).unwrap();
        fs::write(fx.dest.join("root/sub"), "not a dir").unwrap();

        let outcome = run(&fx);
        assert!(!outcome.succeeded);
        assert_eq!(fs::read(fx.dest.join("root/sub")).unwrap(), b"not a dir");
        assert_eq!(fs::read(fx.dest.join("root/a.txt")).unwrap(), b"hi");
        assert!(outcome.into_result(&fx.src).is_err());
    }

    #[test]
    fn test_restrictive_directory_modes_restored() {
        let fx = fixture();
        set_mode(&fx.src.join("sub"), 0o500).unwrap();

        let outcome = run(&fx);
        assert!(outcome.succeeded, "{:?}", outcome.errors);
        let meta = fs::metadata(fx.dest.join("root/sub")).unwrap();
        assert_eq!(mode_of(&meta), 0o500);

        // Second pass has to loosen it again to reconcile children
        let outcome = run(&fx);
        assert!(outcome.succeeded, "{:?}", outcome.errors);

        set_mode(&fx.src.join("sub"), 0o755).unwrap();
        set_mode(&fx.dest.join("root/sub"), 0o755).unwrap();
    }

    #[test]
    fn test_missing_destination_root_fails() {
        let fx = fixture();
        let outcome = replicate(
            &fx.src,
            &fx.dest.join("missing"),
            &ReplicateOptions::default(),
            &NoopLogger,
        );
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failed_units, 1);
    }

    #[test]
    fn test_merge_aggregates() {
        let mut a = ReplicationOutcome::default();
        a.add_file(10);
        let mut b = ReplicationOutcome::default();
        b.fail(SyncError::mismatch("x", "file"), &NoopLogger);
        a.merge(b);
        assert!(!a.succeeded);
        assert_eq!(a.failed_units, 1);
        assert_eq!(a.bytes_copied, 10);
    }
}
