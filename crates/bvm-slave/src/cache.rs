//! Cached view of the host's block devices.
//!
//! Probing runs `lsblk`, so the result is kept until a rescan is requested.

use crate::probe::StorageProbe;
use bvm_core::dtos::{BlockDevice, BtrfsVolume};
use bvm_core::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

const BTRFS: &str = "btrfs";

pub struct BlockDeviceCache {
    probe: Arc<dyn StorageProbe>,
    devices: RwLock<Option<Vec<BlockDevice>>>,
}

impl BlockDeviceCache {
    pub fn new(probe: Arc<dyn StorageProbe>) -> Self {
        Self {
            probe,
            devices: RwLock::new(None),
        }
    }

    /// Probe the host again and replace the cached list.
    pub async fn rescan(&self) -> Result<Vec<BlockDevice>> {
        let devices = self.probe.block_devices().await?;
        info!("Block device scan found {} device(s)", devices.len());

        let mut cached = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        *cached = Some(devices.clone());
        Ok(devices)
    }

    /// Every probed device, scanning on first use.
    pub async fn all(&self) -> Result<Vec<BlockDevice>> {
        let cached = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cached {
            Some(devices) => Ok(devices),
            None => {
                debug!("Block device cache empty, scanning");
                self.rescan().await
            }
        }
    }

    /// Devices carrying a filesystem.
    pub async fn filtered(&self) -> Result<Vec<BlockDevice>> {
        Ok(with_filesystem(self.all().await?))
    }

    pub async fn find_by_uuid(&self, uuid: &str) -> Result<Option<BlockDevice>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|device| !uuid.is_empty() && device.uuid == uuid))
    }

    /// btrfs filesystems, one per UUID.
    pub async fn volumes(&self) -> Result<Vec<BtrfsVolume>> {
        Ok(group_volumes(&self.all().await?))
    }
}

/// Drop devices without a filesystem type (whole disks, empty partitions).
pub fn with_filesystem(devices: Vec<BlockDevice>) -> Vec<BlockDevice> {
    devices
        .into_iter()
        .filter(|device| !device.fs_type.is_empty())
        .collect()
}

/// Group btrfs devices by filesystem UUID, ordered by UUID.
pub fn group_volumes(devices: &[BlockDevice]) -> Vec<BtrfsVolume> {
    let mut volumes: BTreeMap<&str, BtrfsVolume> = BTreeMap::new();
    for device in devices {
        if device.fs_type != BTRFS || device.uuid.is_empty() {
            continue;
        }
        let volume = volumes
            .entry(device.uuid.as_str())
            .or_insert_with(|| BtrfsVolume {
                uuid: device.uuid.clone(),
                label: device.label.clone(),
                devices: Vec::new(),
            });
        if volume.label.is_empty() {
            volume.label = device.label.clone();
        }
        volume.devices.push(device.path.clone());
    }
    volumes.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MountPoint;
    use bvm_core::dtos::BtrfsSubvolume;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device(path: &str, uuid: &str, fs_type: &str, label: &str) -> BlockDevice {
        BlockDevice {
            path: path.into(),
            uuid: uuid.into(),
            fs_type: fs_type.into(),
            label: label.into(),
        }
    }

    struct CountingProbe {
        scans: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StorageProbe for CountingProbe {
        async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
            let scan = self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                device("/dev/sda", "", "", ""),
                device("/dev/sdb", "9f0e", "btrfs", &format!("scan{}", scan)),
            ])
        }

        async fn mount_points(&self) -> Result<Vec<MountPoint>> {
            Ok(Vec::new())
        }

        async fn mount_btrfs_root(&self, _device: &str, _target: &Path) -> Result<()> {
            Ok(())
        }

        async fn subvolumes(&self, _root: &Path) -> Result<Vec<BtrfsSubvolume>> {
            Ok(Vec::new())
        }

        async fn create_subvolume(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn delete_subvolume(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn snapshot_subvolume(&self, _source: &Path, _target: &Path) -> Result<()> {
            Ok(())
        }

        fn os_version(&self) -> String {
            "test".into()
        }
    }

    #[tokio::test]
    async fn test_cache_scans_once_until_rescan() {
        let probe = Arc::new(CountingProbe {
            scans: AtomicUsize::new(0),
        });
        let cache = BlockDeviceCache::new(probe.clone());

        assert_eq!(cache.all().await.unwrap()[1].label, "scan0");
        assert_eq!(cache.all().await.unwrap()[1].label, "scan0");
        assert_eq!(probe.scans.load(Ordering::SeqCst), 1);

        assert_eq!(cache.rescan().await.unwrap()[1].label, "scan1");
        assert_eq!(cache.all().await.unwrap()[1].label, "scan1");
    }

    #[tokio::test]
    async fn test_filtered_skips_devices_without_filesystem() {
        let cache = BlockDeviceCache::new(Arc::new(CountingProbe {
            scans: AtomicUsize::new(0),
        }));
        let devices = cache.filtered().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, "/dev/sdb");

        assert!(cache.find_by_uuid("9f0e").await.unwrap().is_some());
        assert!(cache.find_by_uuid("").await.unwrap().is_none());
    }

    #[test]
    fn test_group_volumes_merges_multi_device_filesystems() {
        let devices = vec![
            device("/dev/sdb", "9f0e", "btrfs", ""),
            device("/dev/sdc", "9f0e", "btrfs", "pool"),
            device("/dev/sdd", "11aa", "btrfs", "scratch"),
            device("/dev/sda1", "3c1d", "vfat", "EFI"),
        ];
        let volumes = group_volumes(&devices);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].uuid, "11aa");
        assert_eq!(volumes[1].label, "pool");
        assert_eq!(volumes[1].devices, vec!["/dev/sdb", "/dev/sdc"]);
    }
}
