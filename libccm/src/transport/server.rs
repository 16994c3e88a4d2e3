//! Socket server that runs on each worker node and dispatches incoming CSI
//! requests to the appropriate trait implementations.

use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_SIZE;
use crate::error::{CcmError, Status};
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts socket connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiNode`]
/// implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiNode + 'static,
{
    /// Bind a listener at `path`, replacing a stale socket left by a previous
    /// run.  Must be called inside a Tokio runtime.
    pub fn bind(
        path: impl Into<PathBuf>,
        handler: Arc<T>,
        request_timeout: Duration,
    ) -> Result<Self, CcmError> {
        let path = path.into();
        remove_stale_socket(&path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(CcmError::transport)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| CcmError::TransportError(format!("bind {}: {e}", path.display())))?;
        info!(path = %path.display(), "CSI server listening");
        Ok(Self {
            listener,
            path,
            handler,
            request_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops [`CsiServer::serve`] and cancels in-flight requests.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Path of the listening socket.
    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the shutdown token fires, then remove the
    /// socket file.
    ///
    /// Each accepted connection is handled on its own Tokio task.
    pub async fn serve(&self) -> Result<(), CcmError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        let cancel = self.shutdown.child_token();
                        let timeout = self.request_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, &handler, cancel, timeout).await {
                                error!(error = %e, "CSI connection handler error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "CSI incoming connection failed"),
                },
            }
        }

        info!("CSI server shutting down");
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket");
            }
            _ => {}
        }
        Ok(())
    }

    /// Process a single connection: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_connection(
        mut stream: UnixStream,
        handler: &T,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<(), CcmError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(CcmError::transport)?;

        let response = if buf.len() as u64 > MAX_MESSAGE_SIZE {
            CsiMessage::Error(Status::invalid_argument(format!(
                "request exceeds {MAX_MESSAGE_SIZE} bytes"
            )))
        } else {
            match serde_json::from_slice::<CsiMessage>(&buf) {
                Ok(request) => {
                    debug!(%request, "CSI request received");
                    let dispatch = Self::dispatch(handler, request, cancel.clone());
                    tokio::pin!(dispatch);
                    match tokio::time::timeout(timeout, &mut dispatch).await {
                        Ok(response) => response,
                        Err(_) => {
                            // Handlers stop at their next checkpoint; wait for it.
                            warn!(?timeout, "CSI request deadline exceeded, cancelling");
                            cancel.cancel();
                            dispatch.await
                        }
                    }
                }
                Err(e) => CsiMessage::Error(Status::invalid_argument(format!(
                    "malformed request: {e}"
                ))),
            }
        };

        let payload = serde_json::to_vec(&response).map_err(CcmError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CcmError::transport)?;
        stream.shutdown().await.map_err(CcmError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage, cancel: CancellationToken) -> CsiMessage {
        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => match handler.probe().await {
                Ok(ok) => CsiMessage::ProbeResult(ok),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginInfo => match handler.get_plugin_info().await {
                Ok(info) => CsiMessage::PluginInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginCapabilities => match handler.get_plugin_capabilities().await {
                Ok(caps) => CsiMessage::PluginCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume {
                volume_id,
                staging_target_path,
            } => match handler.stage_volume(&volume_id, &staging_target_path).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => match handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
            {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::PublishVolume(req) => match handler.publish_volume(req, cancel).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => match handler
                .unpublish_volume(&volume_id, &target_path, cancel)
                .await
            {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ExpandVolume {
                volume_id,
                volume_path,
            } => match handler.expand_volume(&volume_id, &volume_path).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetVolumeStats {
                volume_id,
                volume_path,
            } => match handler.get_volume_stats(&volume_id, &volume_path).await {
                Ok(stats) => CsiMessage::VolumeStatsResponse(stats),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetNodeCapabilities => match handler.get_capabilities().await {
                Ok(caps) => CsiMessage::NodeCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetNodeInfo => match handler.get_info().await {
                Ok(info) => CsiMessage::NodeInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(Status::invalid_argument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }
}

/// Remove a socket left at `path` by an earlier process.  Anything other
/// than a socket is left alone and reported.
fn remove_stale_socket(path: &Path) -> Result<(), CcmError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(CcmError::transport)?;
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => Err(CcmError::TransportError(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CcmError::transport(e)),
    }
}
