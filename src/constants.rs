//! Shared identifiers: driver name, topology key, annotations and tags
//!
//! Everything a StorageClass, PersistentVolume or CSI sidecar uses to talk
//! about this driver lives here, so the scheduler, agent and driver binaries
//! agree on the wire-visible names.

/// CSI driver name; StorageClasses select this driver through their
/// `provisioner` field
pub const DRIVER_NAME: &str = "localvolume.csi.storage.dev";

/// Topology label key pinning a volume to exactly one node
pub const TOPOLOGY_NODE_KEY: &str = "topology.localvolume.csi.storage.dev/hostname";

/// Finalizer retained on a PersistentVolume until its backing logical
/// volume has been removed
pub const RECLAIM_FINALIZER: &str = "storage.localvolume.dev/reclaim-protection";

/// Annotation stamped on a PersistentVolume after the first successful
/// publish; signals the agent that the volume's usage is now reflected in
/// the volume group's free capacity
pub const PUBLISH_SUCCEEDED_ANNOTATION: &str = "localvolume.csi.storage.dev/publish-succeeded";

/// Default name of the node volume group backing all local volumes
pub const DEFAULT_VG_NAME: &str = "localvolume-vg";

/// Default filesystem for freshly created volumes
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Volume-context key selecting the filesystem type
pub const FS_TYPE_TAG: &str = "fsType";

/// Volume-context key selecting linear or striped allocation
pub const ALLOCATION_TAG: &str = "allocationType";
