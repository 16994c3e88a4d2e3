//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes volumes available to
//! Pod containers:
//!
//! 1. **Publish**: materialize the bundle and bind-mount it at the target.
//! 2. **Unpublish**: remove the bind-mount and reclaim orphaned state.
//!
//! Staging, expansion and stats are not offered; their default
//! implementations answer `Unimplemented`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Status;
use crate::types::{NodeCapability, NodeInfo, NodePublishVolumeRequest, VolumeId, VolumeStats};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Publish a volume at `req.target_path`.
    ///
    /// Idempotent: repeating a successful call succeeds again.  `cancel`
    /// fires when the caller gives up; the handler finishes the step in
    /// progress, returns `Cancelled` and leaves partial state for a retry or
    /// a sweep.
    async fn publish_volume(
        &self,
        req: NodePublishVolumeRequest,
        cancel: CancellationToken,
    ) -> Result<(), Status>;

    /// Unpublish a volume from `target_path`.
    ///
    /// Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
        cancel: CancellationToken,
    ) -> Result<(), Status>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, Status>;

    /// Advertise optional node RPCs.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, Status> {
        Ok(vec![NodeCapability::Unknown])
    }

    async fn stage_volume(
        &self,
        _volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn unstage_volume(
        &self,
        _volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn expand_volume(&self, _volume_id: &VolumeId, _volume_path: &str) -> Result<(), Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<VolumeStats, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
