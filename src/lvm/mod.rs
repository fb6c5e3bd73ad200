//! Device Command Layer
//!
//! Synchronous wrappers around the host's volume-group and filesystem
//! tooling. The layer knows nothing about cluster objects: it speaks in
//! volume ids, byte counts and mount targets. The [`DeviceOps`] trait is
//! the seam the lifecycle manager and reconcilers are tested through.

mod host;

pub use host::HostLvm;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::volumes::{GIB, MIB};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the host LVM command layer
#[derive(Debug, Clone)]
pub struct LvmConfig {
    /// Name of the node's single volume group
    pub vg_name: String,
    /// Device path prefix scanned when bootstrapping the volume group
    pub device_prefix: String,
    /// Run volume-group commands inside the host mount namespace
    pub host_namespace: bool,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            vg_name: crate::constants::DEFAULT_VG_NAME.to_string(),
            device_prefix: "/dev/vd".to_string(),
            host_namespace: true,
        }
    }
}

// =============================================================================
// Volume Layout
// =============================================================================

/// How a logical volume is laid out across the group's physical volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VolumeLayout {
    /// Contiguous extents on as few physical volumes as possible
    #[default]
    Linear,
    /// Striped across every physical volume in the group
    Striped,
}

impl FromStr for VolumeLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(VolumeLayout::Linear),
            "striped" | "striping" => Ok(VolumeLayout::Striped),
            other => Err(Error::InvalidArgument(format!(
                "unknown allocation type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for VolumeLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeLayout::Linear => write!(f, "linear"),
            VolumeLayout::Striped => write!(f, "striped"),
        }
    }
}

// =============================================================================
// Size Specification
// =============================================================================

/// A volume size expressed in the whole units LVM tooling accepts:
/// gibibytes, or mebibytes for volumes under one gibibyte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Gib(u64),
    Mib(u64),
}

impl SizeSpec {
    /// Round a requested byte count up to the whole unit a volume is
    /// created with
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes >= GIB {
            SizeSpec::Gib(bytes.div_ceil(GIB))
        } else {
            SizeSpec::Mib(bytes.div_ceil(MIB).max(1))
        }
    }

    /// The rounded size in bytes
    pub fn bytes(&self) -> u64 {
        match self {
            SizeSpec::Gib(n) => n * GIB,
            SizeSpec::Mib(n) => n * MIB,
        }
    }

    /// The `-L` size flag value, e.g. `5g` or `512m`
    pub fn flag(&self) -> String {
        match self {
            SizeSpec::Gib(n) => format!("{}g", n),
            SizeSpec::Mib(n) => format!("{}m", n),
        }
    }
}

// =============================================================================
// Volume Group Report
// =============================================================================

/// Observed state of the node volume group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgReport {
    pub name: String,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub pv_count: u32,
}

impl VgReport {
    /// Total size in whole GiB (floor: partial units are not schedulable)
    pub fn size_gib(&self) -> u64 {
        self.size_bytes / GIB
    }

    /// Free capacity in whole GiB (floor: partial units are not schedulable)
    pub fn free_gib(&self) -> u64 {
        self.free_bytes / GIB
    }
}

// =============================================================================
// Device Operations Port
// =============================================================================

/// Operations against the node's volume group and devices.
///
/// Every call is synchronous and runs the underlying tool to completion;
/// callers on async executors wrap invocations in `spawn_blocking`.
pub trait DeviceOps: Send + Sync {
    /// Create the volume group from unused local devices if it does not
    /// exist yet; returns the number of physical volumes in the group
    fn ensure_volume_group(&self) -> Result<u32>;

    /// Query the volume group; `None` when it does not exist
    fn volume_group(&self) -> Result<Option<VgReport>>;

    /// Device node path for a volume id
    fn device_path(&self, volume_id: &str) -> PathBuf;

    /// Whether the logical volume's device node exists
    fn volume_exists(&self, volume_id: &str) -> bool;

    /// Create a logical volume of the given size and layout
    fn create_volume(&self, volume_id: &str, size: SizeSpec, layout: VolumeLayout) -> Result<()>;

    /// Current size of the logical volume; `None` when it does not exist
    fn volume_size_bytes(&self, volume_id: &str) -> Result<Option<u64>>;

    /// Grow the logical volume to the given size
    fn extend_volume(&self, volume_id: &str, size: SizeSpec) -> Result<()>;

    /// Remove the logical volume; an already-absent volume is success
    fn remove_volume(&self, volume_id: &str) -> Result<()>;

    /// Detect an existing filesystem signature on the device, if any
    fn probe_filesystem(&self, volume_id: &str) -> Result<Option<String>>;

    /// Create a filesystem on the device
    fn format_volume(&self, volume_id: &str, fs_type: &str) -> Result<()>;

    /// Mount the device at the target path
    fn mount_volume(
        &self,
        volume_id: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// Unmount whatever is mounted at the target path
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether anything is mounted at the target path
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Grow the mounted filesystem to fill its device
    fn resize_filesystem(&self, volume_id: &str, target: &Path) -> Result<()>;
}

/// In-memory [`DeviceOps`] used by the driver and agent tests: a map of
/// volumes with sizes, filesystem signatures and mounts, plus call
/// counters for idempotency assertions
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct FakeVolume {
        pub size_bytes: u64,
        pub fs_type: Option<String>,
    }

    #[derive(Default)]
    pub(crate) struct FakeDeviceOps {
        pub vg: Mutex<Option<VgReport>>,
        pub volumes: Mutex<BTreeMap<String, FakeVolume>>,
        pub mounts: Mutex<BTreeMap<PathBuf, String>>,
        pub create_calls: AtomicU32,
        pub format_calls: AtomicU32,
        pub mount_calls: AtomicU32,
        pub extend_calls: AtomicU32,
        pub resize_calls: AtomicU32,
        pub remove_calls: AtomicU32,
    }

    impl FakeDeviceOps {
        pub(crate) fn with_vg(size_bytes: u64, free_bytes: u64) -> Self {
            let fake = Self::default();
            *fake.vg.lock() = Some(VgReport {
                name: crate::constants::DEFAULT_VG_NAME.into(),
                size_bytes,
                free_bytes,
                pv_count: 2,
            });
            fake
        }

        pub(crate) fn volume(&self, volume_id: &str) -> Option<FakeVolume> {
            self.volumes.lock().get(volume_id).cloned()
        }

        pub(crate) fn mount_target_of(&self, volume_id: &str) -> Option<PathBuf> {
            self.mounts
                .lock()
                .iter()
                .find(|(_, id)| id.as_str() == volume_id)
                .map(|(target, _)| target.clone())
        }
    }

    impl DeviceOps for FakeDeviceOps {
        fn ensure_volume_group(&self) -> Result<u32> {
            let mut vg = self.vg.lock();
            if vg.is_none() {
                *vg = Some(VgReport {
                    name: crate::constants::DEFAULT_VG_NAME.into(),
                    size_bytes: 100 * GIB,
                    free_bytes: 100 * GIB,
                    pv_count: 1,
                });
            }
            Ok(vg.as_ref().map(|r| r.pv_count).unwrap_or(0))
        }

        fn volume_group(&self) -> Result<Option<VgReport>> {
            Ok(self.vg.lock().clone())
        }

        fn device_path(&self, volume_id: &str) -> PathBuf {
            PathBuf::from("/dev")
                .join(crate::constants::DEFAULT_VG_NAME)
                .join(volume_id)
        }

        fn volume_exists(&self, volume_id: &str) -> bool {
            self.volumes.lock().contains_key(volume_id)
        }

        fn create_volume(
            &self,
            volume_id: &str,
            size: SizeSpec,
            _layout: VolumeLayout,
        ) -> Result<()> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.volumes.lock().insert(
                volume_id.to_string(),
                FakeVolume {
                    size_bytes: size.bytes(),
                    fs_type: None,
                },
            );
            Ok(())
        }

        fn volume_size_bytes(&self, volume_id: &str) -> Result<Option<u64>> {
            Ok(self.volumes.lock().get(volume_id).map(|v| v.size_bytes))
        }

        fn extend_volume(&self, volume_id: &str, size: SizeSpec) -> Result<()> {
            self.extend_calls.fetch_add(1, Ordering::SeqCst);
            let mut volumes = self.volumes.lock();
            let volume = volumes
                .get_mut(volume_id)
                .ok_or_else(|| Error::DeviceNotFound {
                    device: volume_id.into(),
                })?;
            volume.size_bytes = volume.size_bytes.max(size.bytes());
            Ok(())
        }

        fn remove_volume(&self, volume_id: &str) -> Result<()> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            self.volumes.lock().remove(volume_id);
            Ok(())
        }

        fn probe_filesystem(&self, volume_id: &str) -> Result<Option<String>> {
            Ok(self
                .volumes
                .lock()
                .get(volume_id)
                .and_then(|v| v.fs_type.clone()))
        }

        fn format_volume(&self, volume_id: &str, fs_type: &str) -> Result<()> {
            self.format_calls.fetch_add(1, Ordering::SeqCst);
            let mut volumes = self.volumes.lock();
            let volume = volumes
                .get_mut(volume_id)
                .ok_or_else(|| Error::DeviceNotFound {
                    device: volume_id.into(),
                })?;
            volume.fs_type = Some(fs_type.to_string());
            Ok(())
        }

        fn mount_volume(
            &self,
            volume_id: &str,
            target: &Path,
            _fs_type: &str,
            _options: &[String],
        ) -> Result<()> {
            self.mount_calls.fetch_add(1, Ordering::SeqCst);
            self.mounts
                .lock()
                .insert(target.to_path_buf(), volume_id.to_string());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.mounts.lock().remove(target);
            Ok(())
        }

        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self.mounts.lock().contains_key(target))
        }

        fn resize_filesystem(&self, _volume_id: &str, _target: &Path) -> Result<()> {
            self.resize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
