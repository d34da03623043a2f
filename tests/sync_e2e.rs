use anyhow::Result;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use treesync::fingerprint::Fingerprint;
use treesync::logger::NoopLogger;
use treesync::net_async::client::{sync_tree, ClientOptions, SyncReport};
use treesync::net_async::server::{self, Multiplexer};
use treesync::protocol::{Status, SyncRequest, BLOCK_SIZE, STATUS_LEN};
use treesync::protocol_core::{mode_of, set_mode, SANDBOX_MODE};
use treesync::replicate::{replicate, ReplicateOptions};
use treesync::tree;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Start a multiplexer on an ephemeral loopback port
async fn start_server(root: &Path) -> Result<u16> {
    let mux = Multiplexer::bind("127.0.0.1:0", root).await?;
    let port = mux.local_addr()?.port();
    tokio::spawn(mux.run());
    Ok(port)
}

async fn push(source: &Path, port: u16) -> Result<SyncReport> {
    sync_tree(
        source,
        "127.0.0.1",
        port,
        &ClientOptions::default(),
        Arc::new(NoopLogger),
    )
    .await
}

/// Deferred directory modes land after the control connection closes
async fn wait_for_mode(path: &Path, mode: u32) -> bool {
    for _ in 0..100u32 {
        if let Ok(meta) = std::fs::metadata(path) {
            if mode_of(&meta) == mode {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn sample_source(base: &Path) -> Result<std::path::PathBuf> {
    let root = base.join("root");
    std::fs::create_dir_all(root.join("sub"))?;
    std::fs::write(root.join("a.txt"), "hi")?;
    std::fs::write(root.join("sub/b.txt"), "bye")?;
    set_mode(&root, 0o755)?;
    set_mode(&root.join("sub"), 0o755)?;
    set_mode(&root.join("a.txt"), 0o644)?;
    set_mode(&root.join("sub/b.txt"), 0o600)?;
    Ok(root)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_then_resync_only_sends_changes() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let root = sample_source(src.path())?;
    let port = start_server(dst.path()).await?;

    let report = push(&root, port).await?;
    assert!(report.succeeded(), "{:?}", report.errors);
    assert_eq!(report.dirs_sent, 2);
    assert_eq!(report.files_transferred, 2);
    assert_eq!(report.bytes_transferred, 5);

    let copied = dst.path().join("root");
    assert_eq!(std::fs::read(copied.join("a.txt"))?, b"hi");
    assert_eq!(std::fs::read(copied.join("sub/b.txt"))?, b"bye");
    assert!(tree::isomorphic(&tree::build(&root)?, &tree::build(&copied)?));

    std::fs::write(root.join("a.txt"), "hey")?;
    let report = push(&root, port).await?;
    assert!(report.succeeded(), "{:?}", report.errors);
    assert_eq!(report.files_transferred, 1);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(std::fs::read(copied.join("a.txt"))?, b"hey");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_files_and_many_transfers() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let root = src.path().join("data");
    write_file(&root.join("big.bin"), 1_100_000)?;
    write_file(&root.join("empty"), 0)?;
    for i in 0..12 {
        write_file(&root.join(format!("d{}/f{}.dat", i % 3, i)), 3000 + i)?;
    }
    let port = start_server(dst.path()).await?;

    let report = sync_tree(
        &root,
        "127.0.0.1",
        port,
        &ClientOptions { max_transfers: 2 },
        Arc::new(NoopLogger),
    )
    .await?;
    assert!(report.succeeded(), "{:?}", report.errors);
    assert_eq!(report.files_transferred, 14);

    let copied = dst.path().join("data");
    assert_eq!(std::fs::read(root.join("big.bin"))?, std::fs::read(copied.join("big.bin"))?);
    assert_eq!(std::fs::metadata(copied.join("empty"))?.len(), 0);
    assert!(tree::isomorphic(&tree::build(&root)?, &tree::build(&copied)?));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_subtree_is_skipped() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let root = sample_source(src.path())?;
    std::fs::create_dir(dst.path().join("root"))?;
    std::fs::write(dst.path().join("root/sub"), "not a dir")?;
    let port = start_server(dst.path()).await?;

    let report = push(&root, port).await?;
    assert!(!report.succeeded());
    assert_eq!(report.failed_units, 1);
    assert_eq!(report.files_transferred, 1);
    assert_eq!(std::fs::read(dst.path().join("root/a.txt"))?, b"hi");
    assert_eq!(std::fs::read(dst.path().join("root/sub"))?, b"not a dir");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restrictive_directory_modes_are_restored() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let root = sample_source(src.path())?;
    set_mode(&root.join("sub"), 0o500)?;
    let port = start_server(dst.path()).await?;

    let report = push(&root, port).await;
    set_mode(&root.join("sub"), 0o755)?;
    let report = report?;
    assert!(report.succeeded(), "{:?}", report.errors);

    let sub = dst.path().join("root/sub");
    assert!(wait_for_mode(&sub, 0o500).await);
    assert_eq!(std::fs::read(sub.join("b.txt"))?, b"bye");
    set_mode(&sub, 0o755)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_prefix_uses_sandbox() -> Result<()> {
    let src = tempfile::tempdir()?;
    let prefix = tempfile::tempdir()?;
    let root = sample_source(src.path())?;

    let port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
        let p = sock.local_addr()?.port();
        drop(sock);
        p
    };
    let bind = format!("127.0.0.1:{}", port);
    let prefix_path = prefix.path().to_path_buf();
    let server_task = tokio::spawn(async move {
        let _ = server::serve_prefix(&bind, &prefix_path).await;
    });
    for _ in 0..50u32 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = push(&root, port).await?;
    assert!(report.succeeded(), "{:?}", report.errors);
    let sandbox = prefix.path().join("sandbox");
    assert_eq!(mode_of(&std::fs::metadata(&sandbox)?), SANDBOX_MODE);
    assert_eq!(std::fs::read(sandbox.join("dest/root/sub/b.txt"))?, b"bye");

    server_task.abort();
    set_mode(&sandbox, 0o700)?;
    Ok(())
}

#[tokio::test]
async fn multiplexer_tracks_open_connections() -> Result<()> {
    let dst = tempfile::tempdir()?;
    let mut mux = Multiplexer::bind("127.0.0.1:0", dst.path()).await?;
    let addr = mux.local_addr()?;

    let first = TcpStream::connect(addr).await?;
    mux.step().await;
    let _second = TcpStream::connect(addr).await?;
    mux.step().await;
    assert_eq!(mux.active_connections(), 2);

    drop(first);
    mux.step().await;
    assert_eq!(mux.active_connections(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinked_file_keeps_target_mode() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let root = src.path().join("root");
    std::fs::create_dir(&root)?;
    let target = src.path().join("target.txt");
    std::fs::write(&target, "linked")?;
    set_mode(&target, 0o644)?;
    std::os::unix::fs::symlink(&target, root.join("link.txt"))?;
    let port = start_server(dst.path()).await?;

    let report = push(&root, port).await?;
    assert!(report.succeeded(), "{:?}", report.errors);
    let pushed = dst.path().join("root/link.txt");
    assert_eq!(std::fs::read(&pushed)?, b"linked");
    assert_eq!(mode_of(&std::fs::symlink_metadata(&pushed)?), 0o644);

    let outcome = replicate(&root, local.path(), &ReplicateOptions::default(), &NoopLogger);
    assert!(outcome.succeeded, "{:?}", outcome.errors);
    let copied = local.path().join("root/link.txt");
    assert_eq!(mode_of(&std::fs::symlink_metadata(&copied)?), 0o644);
    Ok(())
}

/// The server runs connections on one thread, as `sync_server` does.
#[tokio::test]
async fn fingerprinting_large_file_does_not_stall_other_connections() -> Result<()> {
    let dst = tempfile::tempdir()?;
    let size: u64 = 512 * 1024 * 1024;
    // Sparse: the server still has to read every byte to fingerprint it
    std::fs::File::create(dst.path().join("big"))?.set_len(size)?;
    let port = start_server(dst.path()).await?;

    let differs = Fingerprint::from_bytes(&[1u8; BLOCK_SIZE]);
    let mut slow = TcpStream::connect(("127.0.0.1", port)).await?;
    slow.write_all(&SyncRequest::file("big", size as i32, 0o644, differs).encode()?)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut quick = TcpStream::connect(("127.0.0.1", port)).await?;
    quick
        .write_all(&SyncRequest::directory("d", 0, 0o755).encode()?)
        .await?;

    let mut slow_reply = [0u8; STATUS_LEN];
    let mut quick_reply = [0u8; STATUS_LEN];
    let quick_first = tokio::select! {
        r = quick.read_exact(&mut quick_reply) => { r?; true }
        r = slow.read_exact(&mut slow_reply) => { r?; false }
    };
    assert!(quick_first, "directory reply waited for the fingerprint");
    assert_eq!(quick_reply, Status::Ok.encode());

    slow.read_exact(&mut slow_reply).await?;
    assert_eq!(slow_reply, Status::SendFile.encode());
    Ok(())
}
