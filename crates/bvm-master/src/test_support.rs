//! In-process connections to a master for handler tests.

use crate::auth::StaticAuthenticator;
use crate::server::AppState;
use bvm_core::dtos::message_type;
use bvm_core::transport::memory;
use bvm_core::{
    default_response_handler, dtos, Connection, ConnectionConfig, RequestContext, Router,
};
use std::sync::Arc;
use std::time::Duration;

pub fn test_state() -> Arc<AppState> {
    let authenticator = StaticAuthenticator::new([("admin".to_string(), "admin".to_string())]);
    AppState::new(Arc::new(authenticator), ConnectionConfig::default())
}

/// Router for the remote end that resolves every response the master sends.
pub fn client_router() -> Router {
    let mut router = Router::new(Arc::new(dtos::standard_registry()));
    for tag in [
        message_type::ERROR,
        message_type::AUTHENTICATION_RESPONSE,
        message_type::STORAGE_SERVER_REGISTRATION_RESPONSE,
        message_type::BLOCK_DEVICE_RESCAN_RESPONSE,
        message_type::STORAGE_SERVER_LIST_RESPONSE,
        message_type::BLOCK_DEVICE_LIST_RESPONSE,
        message_type::BTRFS_VOLUME_LIST_RESPONSE,
        message_type::BTRFS_SUBVOLUME_LIST_RESPONSE,
        message_type::BTRFS_SUBVOLUME_CREATE_RESPONSE,
        message_type::BTRFS_SUBVOLUME_DELETE_RESPONSE,
        message_type::BTRFS_SUBVOLUME_SNAPSHOT_RESPONSE,
    ] {
        router.add_handler(tag, default_response_handler);
    }
    router
}

/// Connect `remote` to the master over an in-process transport.
///
/// Returns the remote end's connection and context.
pub fn connect(state: &Arc<AppState>, remote: Router) -> (Arc<Connection>, Arc<RequestContext>) {
    let ((master_source, master_sink), (remote_source, remote_sink)) = memory::pair(64);

    let (master_connection, master_inbound) = Connection::new(
        master_source,
        master_sink,
        Arc::clone(&state.codec),
        state.connection_config.clone(),
        "memory-remote",
    );
    state
        .router
        .on_new_connection(master_connection.clone(), master_inbound);
    tokio::spawn(master_connection.serve());

    let (remote_connection, remote_inbound) = Connection::new(
        remote_source,
        remote_sink,
        Arc::clone(&state.codec),
        ConnectionConfig::default(),
        "memory-master",
    );
    let ctx = Arc::new(remote).on_new_connection(remote_connection.clone(), remote_inbound);
    tokio::spawn(remote_connection.clone().serve());

    (remote_connection, ctx)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
