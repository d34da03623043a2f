//! Async (Tokio) transport for the treesync server and client.
//!
//! The server is a single readiness loop: the listener and every open
//! connection are waited on together, and each connection only ever consumes
//! the bytes already available to it. The client walks a local tree and
//! drives the control/data exchanges against it.

use anyhow::{Context, Result};
use std::time::Instant;

pub mod server {
    use super::*;
    use crate::connection::{Connection, PathLocks};
    use crate::protocol::Status;
    use crate::protocol_core::prepare_sandbox;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::{AbortHandle, JoinError, JoinSet};

    /// Bookkeeping for one tracked connection
    pub struct ConnectionInfo {
        pub peer: SocketAddr,
        pub opened: Instant,
        handle: AbortHandle,
    }

    enum LoopEvent {
        Accepted(std::io::Result<(TcpStream, SocketAddr)>),
        Closed(std::result::Result<u64, JoinError>),
    }

    pub struct Multiplexer {
        listener: TcpListener,
        root: PathBuf,
        locks: PathLocks,
        /// Tracked connections; always the same set as `tasks`
        table: HashMap<u64, ConnectionInfo>,
        tasks: JoinSet<u64>,
        next_id: u64,
    }

    impl Multiplexer {
        pub async fn bind(bind: &str, root: &Path) -> Result<Self> {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind {}", bind))?;
            let root = std::fs::canonicalize(root)
                .with_context(|| format!("destination root {}", root.display()))?;
            Ok(Self {
                listener,
                root,
                locks: PathLocks::new(),
                table: HashMap::new(),
                tasks: JoinSet::new(),
                next_id: 0,
            })
        }

        pub fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.listener.local_addr()?)
        }

        pub fn active_connections(&self) -> usize {
            self.table.len()
        }

        /// Service connections until the process is killed
        pub async fn run(mut self) -> Result<()> {
            tracing::info!(
                addr = %self.local_addr()?,
                root = %self.root.display(),
                "treesync server listening"
            );
            loop {
                self.step().await;
            }
        }

        /// One loop iteration: wait for the listener or any connection
        pub async fn step(&mut self) {
            let event = tokio::select! {
                accepted = self.listener.accept() => LoopEvent::Accepted(accepted),
                Some(joined) = self.tasks.join_next() => LoopEvent::Closed(joined),
            };
            match event {
                LoopEvent::Accepted(Ok((stream, peer))) => self.register(stream, peer),
                LoopEvent::Accepted(Err(e)) => tracing::warn!(error = %e, "accept failed"),
                LoopEvent::Closed(Ok(id)) => self.remove(id),
                LoopEvent::Closed(Err(e)) => {
                    tracing::error!(error = %e, "connection task failed");
                    self.table.retain(|_, info| !info.handle.is_finished());
                }
            }
        }

        fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
            let _ = stream.set_nodelay(true);
            let id = self.next_id;
            self.next_id += 1;
            let conn = Connection::new(id, self.root.clone(), self.locks.clone());
            let handle = self.tasks.spawn(serve_connection(stream, conn));
            self.table.insert(
                id,
                ConnectionInfo {
                    peer,
                    opened: Instant::now(),
                    handle,
                },
            );
            tracing::debug!(conn = id, %peer, active = self.table.len(), "connection opened");
        }

        fn remove(&mut self, id: u64) {
            if let Some(info) = self.table.remove(&id) {
                tracing::debug!(
                    conn = id,
                    peer = %info.peer,
                    secs = info.opened.elapsed().as_secs_f64(),
                    active = self.table.len(),
                    "connection closed"
                );
            }
        }
    }

    /// Drive one connection's state machine until it completes, errors or
    /// the peer goes away. Returns the connection id for table removal.
    async fn serve_connection(mut stream: TcpStream, mut conn: Connection) -> u64 {
        let id = conn.id();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => {
                    if conn.state() != crate::decoder::State::AwaitingType {
                        tracing::warn!(conn = id, state = ?conn.state(), "peer closed mid-message");
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(conn = id, error = %e, "read failed");
                    break;
                }
            };
            let chunk = buf[..n].to_vec();
            let Some((back, received)) = off_loop(conn, move |c| c.receive(&chunk)).await else {
                return id;
            };
            conn = back;
            let step = match received {
                Ok(step) => step,
                Err(e) => {
                    tracing::warn!(conn = id, error = %e, "dropping connection");
                    break;
                }
            };
            if let Err(e) = write_replies(&mut stream, &step.replies).await {
                tracing::warn!(conn = id, error = %e, "reply failed");
                break;
            }
            if step.close {
                let _ = stream.shutdown().await;
                break;
            }
        }
        if let Some((_, Some(e))) = off_loop(conn, |c| c.finish()).await {
            tracing::warn!(conn = id, error = %e, "transfer incomplete");
        }
        id
    }

    /// Run a filesystem step of `conn` on the blocking pool, keeping the
    /// event loop free for other connections. `None` if the step panicked.
    async fn off_loop<T, F>(mut conn: Connection, step: F) -> Option<(Connection, T)>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> T + Send + 'static,
    {
        let id = conn.id();
        match tokio::task::spawn_blocking(move || {
            let out = step(&mut conn);
            (conn, out)
        })
        .await
        {
            Ok(done) => Some(done),
            Err(e) => {
                tracing::error!(conn = id, error = %e, "connection worker failed");
                None
            }
        }
    }

    async fn write_replies(stream: &mut TcpStream, replies: &[Status]) -> Result<()> {
        if replies.is_empty() {
            return Ok(());
        }
        let bytes: Vec<u8> = replies.iter().flat_map(|s| s.encode()).collect();
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Serve `root` directly, without preparing a sandbox
    pub async fn serve(bind: &str, root: &Path) -> Result<()> {
        Multiplexer::bind(bind, root).await?.run().await
    }

    /// Prepare `prefix/sandbox/dest` and serve it
    pub async fn serve_prefix(bind: &str, prefix: &Path) -> Result<()> {
        let sandbox = prepare_sandbox(prefix)
            .with_context(|| format!("prepare sandbox under {}", prefix.display()))?;
        serve(bind, &sandbox.dest).await
    }
}

pub mod client {
    use super::*;
    use crate::error::SyncError;
    use crate::fingerprint::Fingerprint;
    use crate::logger::Logger;
    use crate::protocol::{Status, SyncRequest, STATUS_LEN};
    use crate::protocol_core::mode_of;
    use crate::replicate::source_name;
    use crate::tree::is_hidden;
    use serde::Serialize;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::Semaphore;
    use tokio::task::JoinSet;
    use walkdir::WalkDir;

    #[derive(Debug, Clone)]
    pub struct ClientOptions {
        /// Data connections open at the same time
        pub max_transfers: usize,
    }

    impl Default for ClientOptions {
        fn default() -> Self {
            Self { max_transfers: 4 }
        }
    }

    #[derive(Debug, Default, Clone, Serialize)]
    pub struct SyncReport {
        pub dirs_sent: u64,
        pub files_sent: u64,
        pub files_skipped: u64,
        pub files_transferred: u64,
        pub bytes_transferred: u64,
        pub failed_units: u64,
        pub errors: Vec<String>,
    }

    impl SyncReport {
        pub fn succeeded(&self) -> bool {
            self.failed_units == 0
        }

        fn fail(&mut self, path: &Path, error: impl std::fmt::Display, logger: &dyn Logger) {
            let msg = error.to_string();
            logger.error("sync", path, &msg);
            self.failed_units += 1;
            self.errors.push(format!("{}: {}", path.display(), msg));
        }
    }

    pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connect {}", addr))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn read_status(stream: &mut TcpStream) -> Result<Status> {
        let mut buf = [0u8; STATUS_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .context("server closed before replying")?;
        Ok(Status::decode(buf)?)
    }

    /// Send one control message and wait for the server's decision
    async fn exchange(control: &mut TcpStream, wire: &[u8]) -> Result<Status> {
        control
            .write_all(wire)
            .await
            .context("send control message")?;
        read_status(control).await
    }

    /// Push `source` to the server. The tree lands under the source's own
    /// name inside the server's destination root.
    ///
    /// Per-unit failures are counted in the report; only a broken control
    /// connection aborts the run.
    pub async fn sync_tree(
        source: &Path,
        host: &str,
        port: u16,
        options: &ClientOptions,
        logger: Arc<dyn Logger>,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let root_name = source_name(source)?;
        let mut control = connect(host, port).await?;
        let mut report = SyncReport::default();

        let permits = Arc::new(Semaphore::new(options.max_transfers.max(1)));
        let mut transfers: JoinSet<(PathBuf, String, Result<u64>)> = JoinSet::new();

        // Pre-order walk; children are pushed reversed to keep listing order
        let mut stack = vec![(source.to_path_buf(), root_name)];
        while let Some((local, remote)) = stack.pop() {
            let meta = match fs::symlink_metadata(&local) {
                Ok(meta) => meta,
                Err(e) => {
                    report.fail(&local, SyncError::access(&local, e), &*logger);
                    continue;
                }
            };

            if meta.is_dir() {
                let size = i32::try_from(meta.len()).unwrap_or(i32::MAX);
                let request = SyncRequest::directory(&remote, size, mode_of(&meta));
                let wire = match request.encode() {
                    Ok(wire) => wire,
                    Err(e) => {
                        report.fail(&local, e, &*logger);
                        continue;
                    }
                };
                match exchange(&mut control, &wire).await? {
                    Status::Ok => report.dirs_sent += 1,
                    status => {
                        // Subtree is skipped
                        report.fail(&local, format!("server replied {status:?}"), &*logger);
                        continue;
                    }
                }
                match visible_children(&local) {
                    Ok(children) => {
                        for name in children.into_iter().rev() {
                            stack.push((local.join(&name), format!("{remote}/{name}")));
                        }
                    }
                    Err(e) => report.fail(&local, e, &*logger),
                }
                continue;
            }

            let is_file = meta.is_file()
                || (meta.file_type().is_symlink()
                    && fs::metadata(&local).map(|m| m.is_file()).unwrap_or(false));
            if !is_file {
                tracing::debug!(path = %local.display(), "skipping special file");
                continue;
            }

            let request = match file_request(&local, &remote).await {
                Ok(request) => request,
                Err(e) => {
                    report.fail(&local, e, &*logger);
                    continue;
                }
            };
            let wire = match request.encode() {
                Ok(wire) => wire,
                Err(e) => {
                    report.fail(&local, e, &*logger);
                    continue;
                }
            };
            logger.start(&local, Path::new(&remote));
            report.files_sent += 1;
            match exchange(&mut control, &wire).await? {
                Status::Ok => {
                    logger.skipped(&local, Path::new(&remote));
                    report.files_skipped += 1;
                }
                Status::SendFile => {
                    let permit = Arc::clone(&permits).acquire_owned().await?;
                    let host = host.to_string();
                    transfers.spawn(async move {
                        let result = send_file(&host, port, &request, &local).await;
                        drop(permit);
                        (local, remote, result)
                    });
                }
                status => report.fail(&local, format!("server replied {status:?}"), &*logger),
            }
        }

        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok((local, remote, Ok(bytes))) => {
                    logger.copy_done(&local, Path::new(&remote), bytes);
                    report.files_transferred += 1;
                    report.bytes_transferred += bytes;
                }
                Ok((local, _, Err(e))) => report.fail(&local, format!("{e:#}"), &*logger),
                Err(e) => report.fail(source, e, &*logger),
            }
        }

        // Closing the control connection lets the server restore directory modes
        let _ = control.shutdown().await;

        logger.done(
            report.dirs_sent + report.files_sent,
            report.failed_units,
            report.bytes_transferred,
            started.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    async fn file_request(local: &Path, remote: &str) -> Result<SyncRequest> {
        let meta = fs::metadata(local).with_context(|| format!("stat {}", local.display()))?;
        let size = i32::try_from(meta.len())
            .with_context(|| format!("{} is too large for the wire format", local.display()))?;
        let path = local.to_path_buf();
        let fingerprint = tokio::task::spawn_blocking(move || Fingerprint::of_file(&path))
            .await?
            .with_context(|| format!("read {}", local.display()))?;
        // Mode of the link target, not of a link itself
        Ok(SyncRequest::file(remote, size, mode_of(&meta), fingerprint))
    }

    fn visible_children(dir: &Path) -> std::result::Result<Vec<String>, SyncError> {
        fs::read_dir(dir).map_err(|e| SyncError::access(dir, e))?;
        let mut names = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| SyncError::access(dir, e.into()))?;
            let Some(name) = entry.file_name().to_str() else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 name");
                continue;
            };
            if !is_hidden(name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Open a data connection and stream exactly `request.size` bytes
    async fn send_file(host: &str, port: u16, request: &SyncRequest, local: &Path) -> Result<u64> {
        let mut stream = connect(host, port).await?;
        stream.write_all(&request.to_transfer().encode()?).await?;

        let expected = request.size as u64;
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("open {}", local.display()))?;
        let mut body = file.take(expected);
        let sent = tokio::io::copy(&mut body, &mut stream).await?;
        if sent != expected {
            anyhow::bail!(
                "{} shrank while sending ({} of {} bytes)",
                local.display(),
                sent,
                expected
            );
        }
        stream.flush().await?;

        match read_status(&mut stream).await? {
            Status::Ok => Ok(sent),
            status => anyhow::bail!("server rejected {}: {:?}", request.path, status),
        }
    }
}
