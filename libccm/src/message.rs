//! CSI protocol messages transmitted over the plugin socket.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the kubelet-side client and the node plugin.

use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::types::*;

/// Top-level message envelope.
///
/// Each connection carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Stage a volume at a global path (Node, unsupported).
    StageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Unstage a previously staged volume (Node, unsupported).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Materialize and bind-mount a volume into a Pod (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Grow a volume (Node, unsupported).
    ExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
    },
    /// Query usage of a volume (Node, unsupported).
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,
    /// Query node capabilities (Node).
    GetNodeCapabilities,
    /// Query node info (Node).
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Volume usage.
    VolumeStatsResponse(VolumeStats),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(Status),
}

impl CsiMessage {
    /// Whether this variant is a request.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::StageVolume { .. }
                | Self::UnstageVolume { .. }
                | Self::PublishVolume(_)
                | Self::UnpublishVolume { .. }
                | Self::ExpandVolume { .. }
                | Self::GetVolumeStats { .. }
                | Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
                | Self::GetNodeCapabilities
                | Self::GetNodeInfo
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageVolume { volume_id, .. } => write!(f, "StageVolume({})", volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::ExpandVolume { volume_id, .. } => write!(f, "ExpandVolume({})", volume_id),
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({})", volume_id),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.bytes_used)
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
