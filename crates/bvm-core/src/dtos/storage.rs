//! Block device and btrfs payloads. Every request here targets one storage
//! server and is forwarded by the master.

use super::StorageServerId;
use serde::{Deserialize, Serialize};

/// Identifier of a btrfs filesystem (the filesystem UUID).
pub type VolumeUuid = String;

/// Requests that name the storage server they must be forwarded to.
pub trait AgentScoped {
    fn server_id(&self) -> StorageServerId;
}

macro_rules! agent_scoped {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl AgentScoped for $ty {
                fn server_id(&self) -> StorageServerId {
                    self.server_id
                }
            }
        )+
    };
}

/// A storage server as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageServer {
    #[serde(rename = "ID")]
    pub id: StorageServerId,
    pub name: String,
    pub slave_version: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
    pub connected_at: String,
}

/// A block device found by the slave's probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub label: String,
}

/// A btrfs filesystem, possibly spanning several devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsVolume {
    pub uuid: VolumeUuid,
    pub label: String,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolume {
    #[serde(rename = "ID")]
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceRescanRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRescanResponse {
    pub block_devices: Vec<BlockDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceListRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceListResponse {
    pub block_devices: Vec<BlockDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsVolumeListRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsVolumeListResponse {
    pub volumes: Vec<BtrfsVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSubvolumeListRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSubvolumeListResponse {
    pub subvolumes: Vec<BtrfsSubvolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeCreateRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeCreateResponse {
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeDeleteRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeDeleteResponse {
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeSnapshotRequest {
    #[serde(rename = "serverID")]
    pub server_id: StorageServerId,
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
    pub target_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtrfsSubvolumeSnapshotResponse {
    #[serde(rename = "volumeUUID")]
    pub volume_uuid: VolumeUuid,
    pub relative_path: String,
    pub target_path: String,
}

agent_scoped!(
    BlockDeviceRescanRequest,
    BlockDeviceListRequest,
    BtrfsVolumeListRequest,
    BtrfsSubvolumeListRequest,
    BtrfsSubvolumeCreateRequest,
    BtrfsSubvolumeDeleteRequest,
    BtrfsSubvolumeSnapshotRequest,
);
