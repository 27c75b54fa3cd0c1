//! Wire payloads and their message type tags.
//!
//! Tags keep the values the browser client already speaks: requests are
//! numbered from 1, responses and errors from 10000.

mod messages;
mod storage;

pub use messages::{
    AuthenticationRequest, AuthenticationResponse, Error, LogoutRequest, ReauthenticationRequest,
    StorageServerListRequest, StorageServerListResponse, StorageServerRegistrationRequest,
    StorageServerRegistrationResponse,
};
pub use storage::{
    AgentScoped, BlockDevice, BlockDeviceListRequest, BlockDeviceListResponse,
    BlockDeviceRescanRequest, BlockDeviceRescanResponse, BtrfsSubvolume,
    BtrfsSubvolumeCreateRequest, BtrfsSubvolumeCreateResponse, BtrfsSubvolumeDeleteRequest,
    BtrfsSubvolumeDeleteResponse, BtrfsSubvolumeListRequest, BtrfsSubvolumeListResponse,
    BtrfsSubvolumeSnapshotRequest, BtrfsSubvolumeSnapshotResponse, BtrfsVolume,
    BtrfsVolumeListRequest, BtrfsVolumeListResponse, StorageServer, VolumeUuid,
};

use crate::registry::TypeRegistry;

/// ID assigned to a storage server by the master's tracker.
pub type StorageServerId = i64;

/// Message type tags.
pub mod message_type {
    use crate::envelope::MessageType;

    pub const AUTHENTICATION_REQUEST: MessageType = 1;
    pub const LOGOUT_REQUEST: MessageType = 2;
    pub const REAUTHENTICATION_REQUEST: MessageType = 3;
    pub const STORAGE_SERVER_REGISTRATION_REQUEST: MessageType = 4;
    pub const BLOCK_DEVICE_RESCAN_REQUEST: MessageType = 5;
    pub const STORAGE_SERVER_LIST_REQUEST: MessageType = 6;
    pub const BLOCK_DEVICE_LIST_REQUEST: MessageType = 7;
    pub const BTRFS_VOLUME_LIST_REQUEST: MessageType = 8;
    pub const BTRFS_SUBVOLUME_LIST_REQUEST: MessageType = 9;
    pub const BTRFS_SUBVOLUME_CREATE_REQUEST: MessageType = 10;
    pub const BTRFS_SUBVOLUME_DELETE_REQUEST: MessageType = 11;
    pub const BTRFS_SUBVOLUME_SNAPSHOT_REQUEST: MessageType = 12;

    pub const ERROR: MessageType = 10000;
    pub const AUTHENTICATION_RESPONSE: MessageType = 10001;
    pub const STORAGE_SERVER_REGISTRATION_RESPONSE: MessageType = 10004;
    pub const BLOCK_DEVICE_RESCAN_RESPONSE: MessageType = 10005;
    pub const STORAGE_SERVER_LIST_RESPONSE: MessageType = 10006;
    pub const BLOCK_DEVICE_LIST_RESPONSE: MessageType = 10007;
    pub const BTRFS_VOLUME_LIST_RESPONSE: MessageType = 10008;
    pub const BTRFS_SUBVOLUME_LIST_RESPONSE: MessageType = 10009;
    pub const BTRFS_SUBVOLUME_CREATE_RESPONSE: MessageType = 10010;
    pub const BTRFS_SUBVOLUME_DELETE_RESPONSE: MessageType = 10011;
    pub const BTRFS_SUBVOLUME_SNAPSHOT_RESPONSE: MessageType = 10012;
}

/// Build the registry holding every payload the master and slave exchange.
///
/// Panics on a duplicate tag or payload type; call it once during wiring.
pub fn standard_registry() -> TypeRegistry {
    use message_type::*;

    TypeRegistry::builder()
        .register::<AuthenticationRequest>(AUTHENTICATION_REQUEST)
        .register::<LogoutRequest>(LOGOUT_REQUEST)
        .register::<ReauthenticationRequest>(REAUTHENTICATION_REQUEST)
        .register::<StorageServerRegistrationRequest>(STORAGE_SERVER_REGISTRATION_REQUEST)
        .register::<BlockDeviceRescanRequest>(BLOCK_DEVICE_RESCAN_REQUEST)
        .register::<StorageServerListRequest>(STORAGE_SERVER_LIST_REQUEST)
        .register::<BlockDeviceListRequest>(BLOCK_DEVICE_LIST_REQUEST)
        .register::<BtrfsVolumeListRequest>(BTRFS_VOLUME_LIST_REQUEST)
        .register::<BtrfsSubvolumeListRequest>(BTRFS_SUBVOLUME_LIST_REQUEST)
        .register::<BtrfsSubvolumeCreateRequest>(BTRFS_SUBVOLUME_CREATE_REQUEST)
        .register::<BtrfsSubvolumeDeleteRequest>(BTRFS_SUBVOLUME_DELETE_REQUEST)
        .register::<BtrfsSubvolumeSnapshotRequest>(BTRFS_SUBVOLUME_SNAPSHOT_REQUEST)
        .register::<Error>(ERROR)
        .register::<AuthenticationResponse>(AUTHENTICATION_RESPONSE)
        .register::<StorageServerRegistrationResponse>(STORAGE_SERVER_REGISTRATION_RESPONSE)
        .register::<BlockDeviceRescanResponse>(BLOCK_DEVICE_RESCAN_RESPONSE)
        .register::<StorageServerListResponse>(STORAGE_SERVER_LIST_RESPONSE)
        .register::<BlockDeviceListResponse>(BLOCK_DEVICE_LIST_RESPONSE)
        .register::<BtrfsVolumeListResponse>(BTRFS_VOLUME_LIST_RESPONSE)
        .register::<BtrfsSubvolumeListResponse>(BTRFS_SUBVOLUME_LIST_RESPONSE)
        .register::<BtrfsSubvolumeCreateResponse>(BTRFS_SUBVOLUME_CREATE_RESPONSE)
        .register::<BtrfsSubvolumeDeleteResponse>(BTRFS_SUBVOLUME_DELETE_RESPONSE)
        .register::<BtrfsSubvolumeSnapshotResponse>(BTRFS_SUBVOLUME_SNAPSHOT_RESPONSE)
        .build()
}
