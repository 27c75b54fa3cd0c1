//! Relay of block device and btrfs requests to the storage server they name.

use bvm_core::dtos::{
    message_type::*, BlockDeviceListRequest, BlockDeviceRescanRequest,
    BtrfsSubvolumeCreateRequest, BtrfsSubvolumeDeleteRequest, BtrfsSubvolumeListRequest,
    BtrfsSubvolumeSnapshotRequest, BtrfsVolumeListRequest,
};
use bvm_core::{default_response_handler, Forwarder, HandlerExporter, Router};
use std::sync::Arc;

pub struct BlockDeviceController {
    forwarder: Arc<Forwarder>,
}

impl BlockDeviceController {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }
}

impl HandlerExporter for BlockDeviceController {
    fn export_handlers(self: &Arc<Self>, router: &mut Router) {
        let forwarder = &self.forwarder;
        forwarder.export::<BlockDeviceRescanRequest>(
            router,
            BLOCK_DEVICE_RESCAN_REQUEST,
            BLOCK_DEVICE_RESCAN_RESPONSE,
        );
        forwarder.export::<BlockDeviceListRequest>(
            router,
            BLOCK_DEVICE_LIST_REQUEST,
            BLOCK_DEVICE_LIST_RESPONSE,
        );
        forwarder.export::<BtrfsVolumeListRequest>(
            router,
            BTRFS_VOLUME_LIST_REQUEST,
            BTRFS_VOLUME_LIST_RESPONSE,
        );
        forwarder.export::<BtrfsSubvolumeListRequest>(
            router,
            BTRFS_SUBVOLUME_LIST_REQUEST,
            BTRFS_SUBVOLUME_LIST_RESPONSE,
        );
        forwarder.export::<BtrfsSubvolumeCreateRequest>(
            router,
            BTRFS_SUBVOLUME_CREATE_REQUEST,
            BTRFS_SUBVOLUME_CREATE_RESPONSE,
        );
        forwarder.export::<BtrfsSubvolumeDeleteRequest>(
            router,
            BTRFS_SUBVOLUME_DELETE_REQUEST,
            BTRFS_SUBVOLUME_DELETE_RESPONSE,
        );
        forwarder.export::<BtrfsSubvolumeSnapshotRequest>(
            router,
            BTRFS_SUBVOLUME_SNAPSHOT_REQUEST,
            BTRFS_SUBVOLUME_SNAPSHOT_RESPONSE,
        );

        // Agents report failures of forwarded requests with an Error payload.
        router.add_handler(ERROR, default_response_handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_router, connect, test_state};
    use bvm_core::dtos::{
        BtrfsSubvolumeCreateResponse, StorageServerRegistrationRequest,
        StorageServerRegistrationResponse,
    };
    use bvm_core::{BvmError, Envelope, RequestContext};

    /// Agent router that creates every subvolume it is asked for.
    fn agent_router() -> bvm_core::Router {
        let mut router = client_router();
        router.add_handler(
            BTRFS_SUBVOLUME_CREATE_REQUEST,
            |ctx: Arc<RequestContext>, envelope: Envelope| async move {
                let request = envelope.expect_payload::<BtrfsSubvolumeCreateRequest>()?;
                ctx.reply(
                    envelope.request_id,
                    BtrfsSubvolumeCreateResponse {
                        volume_uuid: request.volume_uuid.clone(),
                        relative_path: request.relative_path.clone(),
                    },
                )
                .await
            },
        );
        router
    }

    #[test]
    fn test_all_agent_requests_are_routed() {
        let state = test_state();
        for tag in [
            5, 7, 8, 9, 10, 11, 12, 10005, 10007, 10008, 10009, 10010, 10011, 10012, ERROR,
        ] {
            assert!(state.router.has_handler(tag), "no handler for {}", tag);
        }
    }

    #[tokio::test]
    async fn test_subvolume_create_is_relayed() {
        let state = test_state();
        let (_agent_connection, agent) = connect(&state, agent_router());
        let (_client_connection, client) = connect(&state, client_router());

        let server_id = agent
            .call(StorageServerRegistrationRequest {
                server_name: "alpha".into(),
                slave_version: None,
                os_version: None,
            })
            .await
            .unwrap()
            .into_payload::<StorageServerRegistrationResponse>()
            .unwrap()
            .assigned_id;

        let response = client
            .call(BtrfsSubvolumeCreateRequest {
                server_id,
                volume_uuid: "c0ffee".into(),
                relative_path: "data/photos".into(),
            })
            .await
            .unwrap();
        let created = response
            .into_payload::<BtrfsSubvolumeCreateResponse>()
            .unwrap();
        assert_eq!(created.volume_uuid, "c0ffee");
        assert_eq!(created.relative_path, "data/photos");
    }

    #[tokio::test]
    async fn test_request_for_unknown_server_fails() {
        let state = test_state();
        let (_client_connection, client) = connect(&state, client_router());

        let result = client.call(BlockDeviceListRequest { server_id: 12 }).await;
        assert!(matches!(
            result,
            Err(BvmError::Remote { ref subsystem, .. }) if subsystem == "forwarder"
        ));
    }
}
