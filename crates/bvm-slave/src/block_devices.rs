//! Block device and btrfs request handlers run by the storage agent.
//!
//! Each btrfs filesystem is worked on through its top-level subvolume, mounted
//! at `<mount_root>/<volumeUUID>` the first time a request needs it.

use crate::cache::BlockDeviceCache;
use crate::probe::StorageProbe;
use bvm_core::dtos::{
    message_type, BlockDeviceListRequest, BlockDeviceListResponse, BlockDeviceRescanRequest,
    BlockDeviceRescanResponse, BtrfsSubvolumeCreateRequest, BtrfsSubvolumeCreateResponse,
    BtrfsSubvolumeDeleteRequest, BtrfsSubvolumeDeleteResponse, BtrfsSubvolumeListRequest,
    BtrfsSubvolumeListResponse, BtrfsSubvolumeSnapshotRequest, BtrfsSubvolumeSnapshotResponse,
    BtrfsVolumeListRequest, BtrfsVolumeListResponse,
};
use bvm_core::{
    BvmError, Envelope, HandlerExporter, MessageType, Payload, RequestContext, Result, Router,
};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct BlockDeviceController {
    probe: Arc<dyn StorageProbe>,
    cache: BlockDeviceCache,
    mount_root: PathBuf,
}

impl BlockDeviceController {
    pub fn new(probe: Arc<dyn StorageProbe>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            cache: BlockDeviceCache::new(Arc::clone(&probe)),
            probe,
            mount_root: mount_root.into(),
        }
    }

    pub fn cache(&self) -> &BlockDeviceCache {
        &self.cache
    }

    /// Mount the filesystem's top-level subvolume unless it already is, and
    /// return the mount path.
    pub async fn ensure_root_mounted(&self, uuid: &str) -> Result<PathBuf> {
        let device = self
            .cache
            .find_by_uuid(uuid)
            .await?
            .filter(|device| device.fs_type == "btrfs")
            .ok_or_else(|| BvmError::Validation {
                field: "volumeUUID".to_string(),
                message: format!("no btrfs filesystem with UUID '{}'", uuid),
            })?;

        let target = self.mount_root.join(uuid);
        let mounted = self
            .probe
            .mount_points()
            .await?
            .into_iter()
            .any(|mount| mount.target == target);
        if !mounted {
            info!("Mounting {} at {}", device.path, target.display());
            self.probe.mount_btrfs_root(&device.path, &target).await?;
        }
        Ok(target)
    }

    async fn on_rescan(&self, envelope: &Envelope) -> Result<BlockDeviceRescanResponse> {
        envelope.expect_payload::<BlockDeviceRescanRequest>()?;
        self.cache.rescan().await?;
        Ok(BlockDeviceRescanResponse {
            block_devices: self.cache.filtered().await?,
        })
    }

    async fn on_list(&self, envelope: &Envelope) -> Result<BlockDeviceListResponse> {
        envelope.expect_payload::<BlockDeviceListRequest>()?;
        Ok(BlockDeviceListResponse {
            block_devices: self.cache.filtered().await?,
        })
    }

    async fn on_volume_list(&self, envelope: &Envelope) -> Result<BtrfsVolumeListResponse> {
        envelope.expect_payload::<BtrfsVolumeListRequest>()?;
        Ok(BtrfsVolumeListResponse {
            volumes: self.cache.volumes().await?,
        })
    }

    async fn on_subvolume_list(&self, envelope: &Envelope) -> Result<BtrfsSubvolumeListResponse> {
        let request = envelope.expect_payload::<BtrfsSubvolumeListRequest>()?;
        let root = self.ensure_root_mounted(&request.volume_uuid).await?;
        Ok(BtrfsSubvolumeListResponse {
            subvolumes: self.probe.subvolumes(&root).await?,
        })
    }

    async fn on_subvolume_create(
        &self,
        envelope: &Envelope,
    ) -> Result<BtrfsSubvolumeCreateResponse> {
        let request = envelope.expect_payload::<BtrfsSubvolumeCreateRequest>()?;
        let relative = validate_relative_path("relativePath", &request.relative_path)?;
        let root = self.ensure_root_mounted(&request.volume_uuid).await?;

        self.probe.create_subvolume(&root.join(relative)).await?;
        info!(
            "Created subvolume {} on {}",
            request.relative_path, request.volume_uuid
        );
        Ok(BtrfsSubvolumeCreateResponse {
            volume_uuid: request.volume_uuid.clone(),
            relative_path: request.relative_path.clone(),
        })
    }

    async fn on_subvolume_delete(
        &self,
        envelope: &Envelope,
    ) -> Result<BtrfsSubvolumeDeleteResponse> {
        let request = envelope.expect_payload::<BtrfsSubvolumeDeleteRequest>()?;
        let relative = validate_relative_path("relativePath", &request.relative_path)?;
        let root = self.ensure_root_mounted(&request.volume_uuid).await?;

        self.probe.delete_subvolume(&root.join(relative)).await?;
        info!(
            "Deleted subvolume {} on {}",
            request.relative_path, request.volume_uuid
        );
        Ok(BtrfsSubvolumeDeleteResponse {
            volume_uuid: request.volume_uuid.clone(),
            relative_path: request.relative_path.clone(),
        })
    }

    async fn on_subvolume_snapshot(
        &self,
        envelope: &Envelope,
    ) -> Result<BtrfsSubvolumeSnapshotResponse> {
        let request = envelope.expect_payload::<BtrfsSubvolumeSnapshotRequest>()?;
        let source = validate_relative_path("relativePath", &request.relative_path)?;
        let target = validate_relative_path("targetPath", &request.target_path)?;
        let root = self.ensure_root_mounted(&request.volume_uuid).await?;

        self.probe
            .snapshot_subvolume(&root.join(source), &root.join(target))
            .await?;
        info!(
            "Snapshotted {} to {} on {}",
            request.relative_path, request.target_path, request.volume_uuid
        );
        Ok(BtrfsSubvolumeSnapshotResponse {
            volume_uuid: request.volume_uuid.clone(),
            relative_path: request.relative_path.clone(),
            target_path: request.target_path.clone(),
        })
    }
}

/// Check that `raw` stays inside the filesystem root it will be joined to.
pub fn validate_relative_path<'a>(field: &str, raw: &'a str) -> Result<&'a Path> {
    let invalid = |message: &str| BvmError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    };

    let path = Path::new(raw);
    if raw.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"))
            }
        }
    }
    if !path.components().any(|c| matches!(c, Component::Normal(_))) {
        return Err(invalid("path names no subvolume"));
    }
    Ok(path)
}

/// Register `handler` for `request`, replying with its result or an `Error`.
fn export<F, Fut, T>(
    controller: &Arc<BlockDeviceController>,
    router: &mut Router,
    request: MessageType,
    handler: F,
) where
    F: Fn(Arc<BlockDeviceController>, Envelope) -> Fut + Send + Sync + Copy + 'static,
    Fut: Future<Output = (Envelope, Result<T>)> + Send + 'static,
    T: Payload,
{
    let this = Arc::clone(controller);
    router.add_handler(request, move |ctx: Arc<RequestContext>, envelope: Envelope| {
        let this = Arc::clone(&this);
        async move {
            let (envelope, result) = handler(this, envelope).await;
            match result {
                Ok(response) => ctx.reply(envelope.request_id, response).await,
                Err(e) => {
                    warn!("Request {} failed: {}", envelope.request_id, e);
                    ctx.reply_error(envelope.request_id, &e).await
                }
            }
        }
    });
}

impl HandlerExporter for BlockDeviceController {
    fn export_handlers(self: &Arc<Self>, router: &mut Router) {
        use message_type::*;

        debug!("Exporting block device handlers");
        export(self, router, BLOCK_DEVICE_RESCAN_REQUEST, |this, envelope| async move {
            let result = this.on_rescan(&envelope).await;
            (envelope, result)
        });
        export(self, router, BLOCK_DEVICE_LIST_REQUEST, |this, envelope| async move {
            let result = this.on_list(&envelope).await;
            (envelope, result)
        });
        export(self, router, BTRFS_VOLUME_LIST_REQUEST, |this, envelope| async move {
            let result = this.on_volume_list(&envelope).await;
            (envelope, result)
        });
        export(self, router, BTRFS_SUBVOLUME_LIST_REQUEST, |this, envelope| async move {
            let result = this.on_subvolume_list(&envelope).await;
            (envelope, result)
        });
        export(self, router, BTRFS_SUBVOLUME_CREATE_REQUEST, |this, envelope| async move {
            let result = this.on_subvolume_create(&envelope).await;
            (envelope, result)
        });
        export(self, router, BTRFS_SUBVOLUME_DELETE_REQUEST, |this, envelope| async move {
            let result = this.on_subvolume_delete(&envelope).await;
            (envelope, result)
        });
        export(self, router, BTRFS_SUBVOLUME_SNAPSHOT_REQUEST, |this, envelope| async move {
            let result = this.on_subvolume_snapshot(&envelope).await;
            (envelope, result)
        });
    }
}
