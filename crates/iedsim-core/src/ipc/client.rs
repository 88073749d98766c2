//! Unix-socket IPC client for the simulator backend.
//!
//! Speaks the same framed msgpack envelopes as the GUI: one persistent
//! connection, one request in flight at a time.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the stream,
//! allowing safe concurrent use from multiple async tasks.

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::config::IpcConfig;
use crate::document::Document;
use crate::{Result, SimError};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// IPC client connected to a backend socket.
#[derive(Debug)]
pub struct IpcClient {
    stream: Mutex<UnixStream>,
    socket_path: PathBuf,
}

impl IpcClient {
    /// Connect to the backend listening on `socket_path`.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, UnixStream::connect(&socket_path))
            .await
            .map_err(|_| SimError::Transport {
                message: format!("timed out connecting to {}", socket_path.display()),
            })?
            .map_err(|e| SimError::Transport {
                message: format!("failed to connect to {}: {}", socket_path.display(), e),
            })?;

        debug!("IPC client connected to {}", socket_path.display());

        Ok(Self {
            stream: Mutex::new(stream),
            socket_path,
        })
    }

    /// Run an action and return its payload.
    ///
    /// An error envelope becomes `SimError::Other` with the backend's message.
    pub async fn request(&self, action: &str, payload: Document) -> Result<Document> {
        let response = self.request_raw(action, payload).await?;
        match response.error {
            Some(message) => Err(SimError::Other(message)),
            None => Ok(response.payload),
        }
    }

    /// Run an action and return the whole response envelope.
    pub async fn request_raw(&self, action: &str, payload: Document) -> Result<Response> {
        let id = Uuid::new_v4().to_string();
        let request = Request::new(id.clone(), action, payload);
        let response = self.send_bytes(&request.encode()?).await?;
        if response.id != id && !response.id.is_empty() {
            return Err(SimError::Transport {
                message: format!("response id {} does not match request {}", response.id, id),
            });
        }
        Ok(response)
    }

    /// Send an already encoded request body.
    pub async fn send_bytes(&self, body: &[u8]) -> Result<Response> {
        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, body).await.map_err(|e| self.lost(e))?;

        let response_bytes = read_frame(&mut reader)
            .await
            .map_err(|e| self.lost(e))?
            .ok_or_else(|| SimError::Transport {
                message: format!("connection to {} closed", self.socket_path.display()),
            })?;

        Response::decode(&response_bytes)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn lost(&self, err: SimError) -> SimError {
        SimError::Transport {
            message: format!("connection to {} lost: {}", self.socket_path.display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pool::{RequestHandler, WorkerPool};
    use crate::ipc::server::{IpcListener, IpcServerHandle};
    use std::sync::Arc;

    /// Answers `ping` with `{pong: true}` and everything else with an error.
    fn start_server(path: &Path) -> IpcServerHandle {
        let handler: Arc<dyn RequestHandler> = Arc::new(|body: &[u8]| {
            let response = match Request::decode(body) {
                Ok(request) if request.action == "ping" => {
                    Response::success(request.id, [("pong", true)].into_iter().collect())
                }
                Ok(request) => Response::failure(request.id, "Unknown action"),
                Err(err) => Response::decode_error(err),
            };
            response.encode().unwrap()
        });
        let pool = Arc::new(WorkerPool::new(1, handler).unwrap());
        IpcListener::start(path, pool).unwrap()
    }

    #[tokio::test]
    async fn test_client_request_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.sock");
        let _server = start_server(&path);

        let client = IpcClient::connect(&path).await.unwrap();
        let payload = client.request("ping", Document::empty_map()).await.unwrap();
        assert_eq!(payload.get("pong"), Some(&Document::Bool(true)));
    }

    #[tokio::test]
    async fn test_client_error_envelope_returns_err() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.sock");
        let _server = start_server(&path);

        let client = IpcClient::connect(&path).await.unwrap();
        let err = client
            .request("nonexistent", Document::empty_map())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown action");

        let raw = client
            .request_raw("nonexistent", Document::empty_map())
            .await
            .unwrap();
        assert!(raw.is_error());
        assert_eq!(raw.payload, Document::empty_map());
    }

    #[tokio::test]
    async fn test_client_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = IpcClient::connect(dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(SimError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_client_detects_server_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.sock");
        let mut server = start_server(&path);

        let client = IpcClient::connect(&path).await.unwrap();
        assert!(client.request("ping", Document::empty_map()).await.is_ok());

        server.stop();
        assert!(client.request("ping", Document::empty_map()).await.is_err());
    }
}
