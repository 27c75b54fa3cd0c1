//! End-to-end forwarding over real WebSocket connections.
//!
//! A minimal master (tracker, forwarder and a registration handler) listens on
//! a local port; agents and clients dial it with the regular `Dialer`.

use bvm_core::dtos::{
    self, message_type, BlockDevice, BlockDeviceListRequest, BlockDeviceListResponse,
    BtrfsVolumeListRequest, BtrfsVolumeListResponse, StorageServerRegistrationRequest,
    StorageServerRegistrationResponse,
};
use bvm_core::transport::websocket;
use bvm_core::{
    default_response_handler, AgentTracker, BvmError, Connection, ConnectionConfig,
    DialedConnection, Dialer, Envelope, Forwarder, JsonCodec, RequestContext, Router,
    SessionConfig, TypeRegistry, UnknownMessagePolicy,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct TestMaster {
    addr: SocketAddr,
    tracker: Arc<AgentTracker>,
}

impl TestMaster {
    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

fn registry() -> Arc<TypeRegistry> {
    Arc::new(dtos::standard_registry())
}

async fn start_master() -> TestMaster {
    let registry = registry();
    let tracker = Arc::new(AgentTracker::new());
    let forwarder = Arc::new(Forwarder::new(tracker.clone()));

    let mut router =
        Router::new(registry.clone()).with_unknown_policy(UnknownMessagePolicy::ReplyError);
    forwarder.export::<BlockDeviceListRequest>(
        &mut router,
        message_type::BLOCK_DEVICE_LIST_REQUEST,
        message_type::BLOCK_DEVICE_LIST_RESPONSE,
    );
    forwarder.export::<BtrfsVolumeListRequest>(
        &mut router,
        message_type::BTRFS_VOLUME_LIST_REQUEST,
        message_type::BTRFS_VOLUME_LIST_RESPONSE,
    );
    router.add_handler(message_type::ERROR, default_response_handler);

    let registration_tracker = tracker.clone();
    router.add_handler(
        message_type::STORAGE_SERVER_REGISTRATION_REQUEST,
        move |ctx: Arc<RequestContext>, envelope: Envelope| {
            let tracker = registration_tracker.clone();
            async move {
                let request = envelope.expect_payload::<StorageServerRegistrationRequest>()?;
                let id = tracker.register_agent(request.server_name.clone(), ctx.clone());
                ctx.set(SessionConfig::STORAGE_SERVER_ID_KEY, id);
                ctx.reply(
                    envelope.request_id,
                    StorageServerRegistrationResponse { assigned_id: id },
                )
                .await
            }
        },
    );
    let close_tracker = tracker.clone();
    router.add_on_close_handler(move |ctx| {
        if let Some(id) = ctx.get::<i64>(SessionConfig::STORAGE_SERVER_ID_KEY) {
            close_tracker.remove_agent(id);
        }
    });
    let router = Arc::new(router);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let codec = Arc::new(JsonCodec::new(registry));

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let router = router.clone();
            let codec = codec.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (source, sink) = websocket::split(ws);
                let (connection, inbound) = Connection::new(
                    source,
                    sink,
                    codec,
                    ConnectionConfig::default(),
                    peer.to_string(),
                );
                router.on_new_connection(connection.clone(), inbound);
                let _ = connection.serve().await;
            });
        }
    });

    TestMaster { addr, tracker }
}

fn sample_device() -> BlockDevice {
    BlockDevice {
        path: "/dev/vdb".into(),
        uuid: "0b7c6f55".into(),
        fs_type: "btrfs".into(),
        label: "pool".into(),
    }
}

/// Dial as a storage agent that answers block device listings and closes its
/// connection when asked for volumes.
async fn start_agent(master: &TestMaster, name: &str) -> (DialedConnection, i64) {
    let registry = registry();
    let mut router = Router::new(registry.clone());
    router.add_handler(
        message_type::BLOCK_DEVICE_LIST_REQUEST,
        |ctx: Arc<RequestContext>, envelope: Envelope| async move {
            ctx.reply(
                envelope.request_id,
                BlockDeviceListResponse {
                    block_devices: vec![sample_device()],
                },
            )
            .await
        },
    );
    router.add_handler(
        message_type::BTRFS_VOLUME_LIST_REQUEST,
        |ctx: Arc<RequestContext>, _envelope: Envelope| async move {
            ctx.close();
            Ok(())
        },
    );
    router.add_handler(
        message_type::STORAGE_SERVER_REGISTRATION_RESPONSE,
        default_response_handler,
    );
    router.add_handler(message_type::ERROR, default_response_handler);

    let dialer = Dialer::new(Arc::new(JsonCodec::new(registry)), ConnectionConfig::default());
    let dialed = dialer.dial(&master.url(), &Arc::new(router)).await.unwrap();

    let response = dialed
        .context
        .call(StorageServerRegistrationRequest {
            server_name: name.to_string(),
            slave_version: None,
            os_version: None,
        })
        .await
        .unwrap();
    let assigned = response
        .into_payload::<StorageServerRegistrationResponse>()
        .unwrap()
        .assigned_id;
    (dialed, assigned)
}

async fn start_client(master: &TestMaster) -> DialedConnection {
    let registry = registry();
    let mut router = Router::new(registry.clone());
    router.add_handler(message_type::BLOCK_DEVICE_LIST_RESPONSE, default_response_handler);
    router.add_handler(message_type::BTRFS_VOLUME_LIST_RESPONSE, default_response_handler);
    router.add_handler(message_type::ERROR, default_response_handler);

    let dialer = Dialer::new(Arc::new(JsonCodec::new(registry)), ConnectionConfig::default());
    dialer.dial(&master.url(), &Arc::new(router)).await.unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_agents_get_distinct_ids() {
    let master = start_master().await;
    let (_alpha, alpha_id) = start_agent(&master, "alpha").await;
    let (_beta, beta_id) = start_agent(&master, "beta").await;

    let mut ids = vec![alpha_id, beta_id];
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(master.tracker.len(), 2);
}

#[tokio::test]
async fn test_request_is_forwarded_and_answered() {
    let master = start_master().await;
    let (_agent, server_id) = start_agent(&master, "alpha").await;
    let client = start_client(&master).await;

    // Spend a few client IDs so client and agent ID spaces diverge.
    for _ in 0..3 {
        let _ = client.context.new_request();
    }

    let response = client
        .context
        .call(BlockDeviceListRequest { server_id })
        .await
        .unwrap();
    assert_eq!(response.request_id, 3);
    let payload = response.into_payload::<BlockDeviceListResponse>().unwrap();
    assert_eq!(payload.block_devices, vec![sample_device()]);
}

#[tokio::test]
async fn test_unknown_agent_gets_error_reply() {
    let master = start_master().await;
    let client = start_client(&master).await;

    let result = client
        .context
        .call(BlockDeviceListRequest { server_id: 99 })
        .await;
    match result {
        Err(BvmError::Remote { subsystem, details }) => {
            assert_eq!(subsystem, "forwarder");
            assert!(details.contains("99"));
        }
        other => panic!("Expected Remote error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_disconnect_mid_call_reports_error() {
    let master = start_master().await;
    let (_agent, server_id) = start_agent(&master, "alpha").await;
    let client = start_client(&master).await;

    let result = client
        .context
        .call(BtrfsVolumeListRequest { server_id })
        .await;
    match result {
        Err(BvmError::Remote { subsystem, .. }) => assert_eq!(subsystem, "forwarder"),
        Ok(envelope) => panic!(
            "Expected an error, got {:?}",
            envelope.payload_as::<BtrfsVolumeListResponse>()
        ),
        Err(other) => panic!("Expected Remote error, got: {:?}", other),
    }

    let tracker = master.tracker.clone();
    wait_until(move || tracker.is_empty()).await;
}

#[tokio::test]
async fn test_client_close_abandons_pending_calls() {
    let master = start_master().await;
    let client = start_client(&master).await;

    let slots: Vec<_> = (0..8).map(|_| client.context.new_request()).collect();
    assert_eq!(client.context.pending_count(), 8);
    client.connection.close();
    client.connection.closed().await;

    for (id, slot) in slots {
        let result = tokio::time::timeout(Duration::from_secs(5), slot)
            .await
            .expect("pending call not abandoned in time");
        assert!(
            matches!(result, Err(BvmError::Abandoned(abandoned)) if abandoned == id),
            "request {} resolved with {:?}",
            id,
            result
        );
    }
    assert_eq!(client.context.pending_count(), 0);
}
