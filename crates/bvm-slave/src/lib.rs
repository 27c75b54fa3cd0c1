//! BVM Slave - storage agent for the btrfs volume manager.
//!
//! The agent dials the master, logs in, registers itself as a storage server
//! and then answers the block device and btrfs requests the master forwards.

pub mod block_devices;
pub mod cache;
pub mod probe;
pub mod session;

pub use block_devices::BlockDeviceController;
pub use cache::BlockDeviceCache;
pub use probe::{MountPoint, StorageProbe, SystemProbe};
pub use session::{authenticate, register, SessionResponses, SLAVE_VERSION};

use bvm_core::{dtos, HandlerExporter, Router};
use std::path::PathBuf;
use std::sync::Arc;

/// Build the agent's router: session responses plus the storage handlers.
pub fn agent_router(probe: Arc<dyn StorageProbe>, mount_root: impl Into<PathBuf>) -> Router {
    let mut router = Router::new(Arc::new(dtos::standard_registry()));
    Arc::new(SessionResponses).export_handlers(&mut router);
    Arc::new(BlockDeviceController::new(probe, mount_root)).export_handlers(&mut router);
    router
}
