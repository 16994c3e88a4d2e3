//! Client used by the kubelet side (and tests) to issue CSI requests.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_SIZE;
use crate::error::CcmError;
use crate::message::CsiMessage;

/// Sends [`CsiMessage`] requests to a plugin socket, one connection per
/// request.
#[derive(Debug, Clone)]
pub struct CsiClient {
    socket: PathBuf,
}

impl CsiClient {
    /// Create a client for the plugin listening at `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new connection, writes the JSON-serialized request,
    /// shuts down the write half, then reads the full response and
    /// deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CcmError> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(CcmError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CcmError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CcmError::transport)?;
        stream.shutdown().await.map_err(CcmError::transport)?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE)
            .read_to_end(&mut buf)
            .await
            .map_err(CcmError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CcmError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }
}
