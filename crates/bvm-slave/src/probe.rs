//! Access to the host's block devices and btrfs filesystems.
//!
//! [`SystemProbe`] shells out to `lsblk`, `mount` and the `btrfs` tool; tests
//! substitute their own [`StorageProbe`].

use bvm_core::dtos::{BlockDevice, BtrfsSubvolume};
use bvm_core::{BvmError, Result};
use regex::Regex;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

const MOUNTS_FILE: &str = "/proc/self/mounts";

/// `ID 257 gen 12 top level 5 path home/photos`
static SUBVOLUME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ID (\d+) gen \d+ top level (\d+) path (.+)$")
        .expect("subvolume list regex must compile")
});

/// A mounted filesystem as listed by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
}

/// Operations the agent needs from the host.
#[async_trait::async_trait]
pub trait StorageProbe: Send + Sync + 'static {
    /// All block devices, including ones without a filesystem.
    async fn block_devices(&self) -> Result<Vec<BlockDevice>>;

    async fn mount_points(&self) -> Result<Vec<MountPoint>>;

    /// Mount the top-level subvolume of the btrfs filesystem on `device`.
    async fn mount_btrfs_root(&self, device: &str, target: &Path) -> Result<()>;

    /// Subvolumes of the filesystem mounted at `root`.
    async fn subvolumes(&self, root: &Path) -> Result<Vec<BtrfsSubvolume>>;

    async fn create_subvolume(&self, path: &Path) -> Result<()>;

    async fn delete_subvolume(&self, path: &Path) -> Result<()>;

    /// Snapshot `source` into `target`.
    async fn snapshot_subvolume(&self, source: &Path, target: &Path) -> Result<()>;

    /// Human-readable OS description reported at registration.
    fn os_version(&self) -> String;
}

/// Probe backed by the host's command-line tools.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

async fn run(program: &str, args: &[&OsStr]) -> Result<String> {
    debug!("Running {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| BvmError::Probe(format!("cannot run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(BvmError::Probe(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait::async_trait]
impl StorageProbe for SystemProbe {
    async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let args = ["--json", "--paths", "-o", "NAME,UUID,FSTYPE,LABEL"].map(OsStr::new);
        let output = run("lsblk", &args).await?;
        parse_lsblk(&output)
    }

    async fn mount_points(&self) -> Result<Vec<MountPoint>> {
        let content = tokio::fs::read_to_string(MOUNTS_FILE)
            .await
            .map_err(|e| BvmError::Probe(format!("cannot read {}: {}", MOUNTS_FILE, e)))?;
        Ok(parse_mounts(&content))
    }

    async fn mount_btrfs_root(&self, device: &str, target: &Path) -> Result<()> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| BvmError::Probe(format!("cannot create {}: {}", target.display(), e)))?;
        let args = [
            OsStr::new("-t"),
            OsStr::new("btrfs"),
            OsStr::new("-o"),
            OsStr::new("subvolid=5"),
            OsStr::new(device),
            target.as_os_str(),
        ];
        run("mount", &args).await.map(drop)
    }

    async fn subvolumes(&self, root: &Path) -> Result<Vec<BtrfsSubvolume>> {
        let args = [OsStr::new("subvolume"), OsStr::new("list"), root.as_os_str()];
        let output = run("btrfs", &args).await?;
        Ok(parse_subvolume_list(&output))
    }

    async fn create_subvolume(&self, path: &Path) -> Result<()> {
        let args = [OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()];
        run("btrfs", &args).await.map(drop)
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let args = [OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()];
        run("btrfs", &args).await.map(drop)
    }

    async fn snapshot_subvolume(&self, source: &Path, target: &Path) -> Result<()> {
        let args = [
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            source.as_os_str(),
            target.as_os_str(),
        ];
        run("btrfs", &args).await.map(drop)
    }

    fn os_version(&self) -> String {
        sysinfo::System::long_os_version().unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    uuid: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn flatten(device: LsblkDevice, out: &mut Vec<BlockDevice>) {
    out.push(BlockDevice {
        path: device.name,
        uuid: device.uuid.unwrap_or_default(),
        fs_type: device.fstype.unwrap_or_default(),
        label: device.label.unwrap_or_default(),
    });
    for child in device.children {
        flatten(child, out);
    }
}

/// Parse `lsblk --json` output into a flat device list, parents first.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| BvmError::Probe(format!("unexpected lsblk output: {}", e)))?;

    let mut devices = Vec::new();
    for device in output.blockdevices {
        flatten(device, &mut devices);
    }
    Ok(devices)
}

/// Parse `btrfs subvolume list` output. Unrecognized lines are skipped.
pub fn parse_subvolume_list(output: &str) -> Vec<BtrfsSubvolume> {
    output
        .lines()
        .filter_map(|line| {
            let captures = SUBVOLUME_LINE.captures(line.trim())?;
            Some(BtrfsSubvolume {
                id: captures[1].parse().ok()?,
                parent_id: captures[2].parse().ok()?,
                path: captures[3].to_string(),
            })
        })
        .collect()
}

/// Undo the octal escapes the kernel applies to mount paths.
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Parse a `/proc/mounts` style table.
pub fn parse_mounts(content: &str) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountPoint {
                source: unescape_mount_path(source),
                target: PathBuf::from(unescape_mount_path(target)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}
