//! Unix-domain-socket listener for the simulator backend.
//!
//! Binds the socket path, accepts connections from the GUI and feeds every
//! request frame to the [`WorkerPool`]. Responses are written back on the
//! connection that sent the request, in request order.
//!
//! # Threading
//!
//! The listener owns one `ipc-listener` OS thread running a current-thread
//! tokio runtime. That runtime multiplexes the accept loop and every open
//! connection; action code only ever runs on the pool's workers.

use super::pool::{Task, WorkerPool};
use super::protocol::read_frame;
use crate::config::IpcConfig;
use crate::{Result, SimError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Handle to a running listener. Dropping it stops the listener.
pub struct IpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
    connections: Arc<AtomicUsize>,
    pool: Arc<WorkerPool>,
}

impl IpcServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of currently open client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting, close every connection, remove the socket file and
    /// shut down the worker pool.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);

        if thread.join().is_err() {
            error!("IPC listener thread panicked");
        }
        if let Err(err) = remove_socket_file(&self.socket_path) {
            warn!("Failed to remove {}: {}", self.socket_path.display(), err);
        }
        self.pool.shutdown();
        info!("IPC listener stopped");
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for IpcServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServerHandle")
            .field("socket_path", &self.socket_path)
            .field("connections", &self.connection_count())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn remove_socket_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// IPC listener bound to a Unix socket path.
pub struct IpcListener;

impl IpcListener {
    /// Bind `socket_path` and start serving requests through `pool`.
    ///
    /// A stale socket file from a previous run is removed first. Bind
    /// failures are returned before any thread is spawned.
    pub fn start(socket_path: impl AsRef<Path>, pool: Arc<WorkerPool>) -> Result<IpcServerHandle> {
        let socket_path = socket_path.as_ref().to_path_buf();
        remove_socket_file(&socket_path)?;

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).map_err(|e| {
            SimError::Transport {
                message: format!("failed to bind {}: {}", socket_path.display(), e),
            }
        })?;
        listener.set_nonblocking(true)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let connections = Arc::new(AtomicUsize::new(0));

        let thread = {
            let pool = pool.clone();
            let connections = connections.clone();
            std::thread::Builder::new()
                .name("ipc-listener".to_string())
                .spawn(move || {
                    runtime.block_on(async move {
                        match UnixListener::from_std(listener) {
                            Ok(listener) => {
                                Self::accept_loop(
                                    listener,
                                    pool,
                                    shutdown_rx,
                                    conn_shutdown_rx,
                                    connections,
                                )
                                .await
                            }
                            Err(e) => error!("Failed to register IPC listener: {}", e),
                        }
                    });
                })
                .map_err(|e| SimError::Transport {
                    message: format!("failed to spawn listener thread: {}", e),
                })?
        };

        info!("IPC server listening on {}", socket_path.display());

        Ok(IpcServerHandle {
            socket_path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            thread: Some(thread),
            connections,
            pool,
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        pool: Arc<WorkerPool>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection: at max capacity ({})",
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let pool = pool.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tasks.spawn(async move {
                                debug!("IPC connection opened");
                                if let Err(e) = Self::handle_connection(stream, &pool, &mut conn_shutdown).await {
                                    if e.is_disconnect() {
                                        debug!("IPC connection ended: {}", e);
                                    } else {
                                        warn!("IPC connection closed: {}", e);
                                    }
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}
    }

    async fn handle_connection(
        mut stream: UnixStream,
        pool: &WorkerPool,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let (task, reply) = Task::new(frame);
            pool.submit(task)?;

            let response = tokio::select! {
                result = reply => result.map_err(|_| SimError::Transport {
                    message: "worker dropped the request".to_string(),
                })?,
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}
