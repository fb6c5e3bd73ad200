//! Host LVM adapter
//!
//! Shells out to lvm2, mkfs/blkid and mount in the host's mount namespace
//! (via nsenter) for device-level commands; mount-table inspection and the
//! kubelet target mounts happen in this process's own namespace, where the
//! kubelet paths are visible.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DeviceOps, LvmConfig, SizeSpec, VgReport, VolumeLayout};
use crate::error::{Error, Result};

/// lvm2 error marker for a missing logical volume
const LV_NOT_FOUND: &str = "Failed to find logical volume";

/// lvm2 error marker for a missing volume group
const VG_NOT_FOUND: &str = "not found";

/// Device suffixes probed when bootstrapping the volume group
const DEVICE_SUFFIXES: &str = "bcdefghijklmnopqrstuvwxyz";

// =============================================================================
// Host LVM
// =============================================================================

/// [`DeviceOps`] implementation backed by the host's lvm2 tooling
pub struct HostLvm {
    config: LvmConfig,
}

impl HostLvm {
    pub fn new(config: LvmConfig) -> Self {
        Self { config }
    }

    /// Run a device-level command, entering the host mount namespace when
    /// configured to do so
    fn run_host(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = if self.config.host_namespace {
            let mut cmd = Command::new("nsenter");
            cmd.arg("--mount=/proc/1/ns/mnt").arg("--").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args);

        debug!("running host command: {} {}", program, args.join(" "));
        let output = cmd.output().map_err(|e| Error::DeviceCommand {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::DeviceCommand {
                command: format!("{} {}", program, args.join(" ")),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command in this process's own mount namespace
    fn run_local(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::DeviceCommand {
                command: program.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::DeviceCommand {
                command: format!("{} {}", program, args.join(" ")),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Unused local block devices eligible for the volume group: present,
    /// not mounted and not already an LVM physical volume
    fn candidate_devices(&self) -> Vec<String> {
        let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
        let mut result = Vec::new();

        for suffix in DEVICE_SUFFIXES.chars() {
            let device = format!("{}{}", self.config.device_prefix, suffix);
            if !Path::new(&device).exists() {
                continue;
            }
            if device_in_mount_table(&mounts, &device) {
                continue;
            }
            // pvs succeeding means the device already belongs to a group
            if self.run_host("pvs", &[&device]).is_ok() {
                continue;
            }
            result.push(device);
        }
        result
    }

    fn qualified_volume(&self, volume_id: &str) -> String {
        format!("{}/{}", self.config.vg_name, volume_id)
    }
}

impl DeviceOps for HostLvm {
    fn ensure_volume_group(&self) -> Result<u32> {
        if let Some(report) = self.volume_group()? {
            return Ok(report.pv_count);
        }

        let devices = self.candidate_devices();
        if devices.is_empty() {
            return Err(Error::VolumeGroupMissing {
                vg: self.config.vg_name.clone(),
            });
        }
        info!("bootstrapping volume group {} from {:?}", self.config.vg_name, devices);

        let device_refs: Vec<&str> = devices.iter().map(String::as_str).collect();
        self.run_host("pvcreate", &device_refs)?;

        let mut vgcreate_args = vec![self.config.vg_name.as_str()];
        vgcreate_args.extend(&device_refs);
        self.run_host("vgcreate", &vgcreate_args)?;

        Ok(devices.len() as u32)
    }

    fn volume_group(&self) -> Result<Option<VgReport>> {
        let output = self.run_host(
            "vgs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_name,vg_size,vg_free,pv_count",
                &self.config.vg_name,
            ],
        );
        match output {
            Ok(json) => Ok(Some(parse_vgs_report(&json, &self.config.vg_name)?)),
            Err(Error::DeviceCommand { reason, .. }) if reason.contains(VG_NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn device_path(&self, volume_id: &str) -> PathBuf {
        PathBuf::from("/dev")
            .join(&self.config.vg_name)
            .join(volume_id)
    }

    fn volume_exists(&self, volume_id: &str) -> bool {
        self.device_path(volume_id).exists()
    }

    fn create_volume(&self, volume_id: &str, size: SizeSpec, layout: VolumeLayout) -> Result<()> {
        let pv_count = self.ensure_volume_group()?;
        let size_flag = size.flag();

        match layout {
            VolumeLayout::Striped => {
                let stripes = pv_count.max(1).to_string();
                self.run_host(
                    "lvcreate",
                    &[
                        "-i",
                        &stripes,
                        "-n",
                        volume_id,
                        "-L",
                        &size_flag,
                        &self.config.vg_name,
                    ],
                )?;
            }
            VolumeLayout::Linear => {
                self.run_host(
                    "lvcreate",
                    &["-n", volume_id, "-L", &size_flag, &self.config.vg_name],
                )?;
            }
        }
        info!(
            "created {} volume {}/{} size {}",
            layout, self.config.vg_name, volume_id, size_flag
        );
        Ok(())
    }

    fn volume_size_bytes(&self, volume_id: &str) -> Result<Option<u64>> {
        let output = self.run_host(
            "lvs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_name,lv_size",
                &self.qualified_volume(volume_id),
            ],
        );
        match output {
            Ok(json) => Ok(Some(parse_lvs_size(&json)?)),
            Err(Error::DeviceCommand { reason, .. }) if reason.contains(LV_NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn extend_volume(&self, volume_id: &str, size: SizeSpec) -> Result<()> {
        let device = self.device_path(volume_id);
        let size_flag = format!("-L{}", size.flag());
        self.run_host("lvextend", &[&size_flag, &device.to_string_lossy()])?;
        info!("extended volume {} to {}", device.display(), size.flag());
        Ok(())
    }

    fn remove_volume(&self, volume_id: &str) -> Result<()> {
        let device = self.device_path(volume_id);
        match self.run_host("lvremove", &["-f", &device.to_string_lossy()]) {
            Ok(_) => {
                info!("removed volume {}", device.display());
                Ok(())
            }
            Err(Error::DeviceCommand { reason, .. }) if reason.contains(LV_NOT_FOUND) => {
                debug!("volume {} already absent", device.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn probe_filesystem(&self, volume_id: &str) -> Result<Option<String>> {
        let device = self.device_path(volume_id);
        let device = device.to_string_lossy();

        // `file -bsL` answers "data" for a device without any signature;
        // blkid then names the filesystem. blkid is not used for the
        // initial check because it exits non-zero on blank devices.
        let summary = self.run_host("file", &["-bsL", &device])?;
        if summary.trim() == "data" {
            return Ok(None);
        }

        let export = self.run_host("blkid", &["-c", "/dev/null", "-o", "export", &device])?;
        parse_blkid_export(&export).map(Some)
    }

    fn format_volume(&self, volume_id: &str, fs_type: &str) -> Result<()> {
        let device = self.device_path(volume_id);
        self.run_host("mkfs", &["-t", fs_type, &device.to_string_lossy()])?;
        info!("formatted {} as {}", device.display(), fs_type);
        Ok(())
    }

    fn mount_volume(
        &self,
        volume_id: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let device = self.device_path(volume_id);
        let device = device.to_string_lossy();
        let target = target.to_string_lossy();

        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !options.is_empty() {
            args.push("-o");
            args.push(&joined);
        }
        args.push(&device);
        args.push(&target);

        self.run_local("mount", &args)?;
        info!("mounted {} at {} ({})", device, target, fs_type);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.run_local("umount", &[&target.to_string_lossy()])?;
        info!("unmounted {}", target.display());
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        if !target.exists() {
            return Ok(false);
        }
        let mounts = std::fs::read_to_string("/proc/mounts")?;
        Ok(target_in_mount_table(&mounts, &target.to_string_lossy()))
    }

    fn resize_filesystem(&self, volume_id: &str, target: &Path) -> Result<()> {
        let device = self.device_path(volume_id);
        let fs_type = self.probe_filesystem(volume_id)?.unwrap_or_default();

        match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => {
                self.run_host("resize2fs", &[&device.to_string_lossy()])?;
            }
            "xfs" => {
                self.run_host("xfs_growfs", &[&target.to_string_lossy()])?;
            }
            other => {
                warn!("cannot grow filesystem {:?} on {}", other, device.display());
                return Err(Error::DeviceCommand {
                    command: "resizefs".into(),
                    reason: format!("unsupported filesystem: {}", other),
                });
            }
        }
        info!("grew {} filesystem on {}", fs_type, device.display());
        Ok(())
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct VgsOutput {
    report: Vec<VgsReportEntry>,
}

#[derive(Debug, Deserialize)]
struct VgsReportEntry {
    #[serde(default)]
    vg: Vec<VgsRow>,
}

#[derive(Debug, Deserialize)]
struct VgsRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
    pv_count: String,
}

fn parse_vgs_report(json: &str, vg_name: &str) -> Result<VgReport> {
    let output: VgsOutput = serde_json::from_str(json)?;
    let row = output
        .report
        .iter()
        .flat_map(|r| r.vg.iter())
        .find(|row| row.vg_name == vg_name)
        .ok_or_else(|| Error::VolumeGroupMissing {
            vg: vg_name.to_string(),
        })?;

    Ok(VgReport {
        name: row.vg_name.clone(),
        size_bytes: parse_lvm_number(&row.vg_size)?,
        free_bytes: parse_lvm_number(&row.vg_free)?,
        pv_count: parse_lvm_number(&row.pv_count)? as u32,
    })
}

#[derive(Debug, Deserialize)]
struct LvsOutput {
    report: Vec<LvsReportEntry>,
}

#[derive(Debug, Deserialize)]
struct LvsReportEntry {
    #[serde(default)]
    lv: Vec<LvsRow>,
}

#[derive(Debug, Deserialize)]
struct LvsRow {
    lv_size: String,
}

fn parse_lvs_size(json: &str) -> Result<u64> {
    let output: LvsOutput = serde_json::from_str(json)?;
    let row = output
        .report
        .iter()
        .flat_map(|r| r.lv.iter())
        .next()
        .ok_or_else(|| Error::Internal("lvs report contained no volumes".into()))?;
    parse_lvm_number(&row.lv_size)
}

/// lvm reports numbers as strings; `--nosuffix --units b` leaves plain
/// integers, but be tolerant of a trailing unit character
fn parse_lvm_number(s: &str) -> Result<u64> {
    let trimmed = s.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
    trimmed
        .parse::<u64>()
        .map_err(|_| Error::CapacityParse(format!("bad lvm number: {}", s)))
}

/// Extract the TYPE field from `blkid -o export` output
fn parse_blkid_export(output: &str) -> Result<String> {
    for line in output.lines() {
        if let Some((key, value)) = line.trim().split_once('=') {
            if key == "TYPE" {
                return Ok(value.to_string());
            }
        }
    }
    Err(Error::DeviceCommand {
        command: "blkid".into(),
        reason: "no TYPE field in export output".into(),
    })
}

/// Whether the mount table lists the given path as a mount point
fn target_in_mount_table(mounts: &str, target: &str) -> bool {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == target)
}

/// Whether the mount table lists the given device as mounted
fn device_in_mount_table(mounts: &str, device: &str) -> bool {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| source == device)
}
