//! Finds the eMMC to install onto and checks it is safe to do so.
//!
//! Nothing here writes to storage.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::layout::RootFsType;
use crate::registry::FamilyFilter;
use crate::release::ReleaseValues;
use crate::session::InstallContext;

/// Byte window read from the start of the kernel image.
pub const KERNEL_HEADER_LEN: usize = 16;
/// Offset of the 16-bit word inside the arm64 `text_offset` field.
pub const KERNEL_MARKER_OFFSET: usize = 10;
/// `text_offset == 0x01080000`: the kernel carries the Amlogic load-offset patch.
pub const KERNEL_OFFSET_PATCH_MARKER: u16 = 0x0108;

/// Read-only view of the running system.
pub trait Inventory {
    /// Block device backing `/`, e.g. `/dev/sda2`.
    fn root_source(&self) -> Result<String>;
    /// Kernel names of all block devices and partitions.
    fn block_devices(&self) -> Result<Vec<String>>;
    fn kernel_random_uuid(&self) -> Option<String>;
    fn generated_uuid(&self) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct LiveInventory;

fn capture(program: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(program).args(args).output().map_err(|e| {
        Error::new(
            ErrorKind::Precondition,
            format!("failed to run {program}: {e}"),
        )
    })?;
    if !out.status.success() {
        return Err(Error::new(
            ErrorKind::Precondition,
            format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

impl Inventory for LiveInventory {
    fn root_source(&self) -> Result<String> {
        let out = capture("findmnt", &["-n", "-o", "SOURCE", "/"])?;
        Ok(out.trim().to_string())
    }

    fn block_devices(&self) -> Result<Vec<String>> {
        let out = capture("lsblk", &["-l", "-n", "-o", "NAME"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn kernel_random_uuid(&self) -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/random/uuid")
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn generated_uuid(&self) -> Option<String> {
        Some(uuid::Uuid::new_v4().to_string())
    }
}

fn partition_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<base>(?:mmcblk|nvme|loop)\S*\d)p\d+$|^(?P<sd>(?:sd|hd|vd|xvd)[a-z]+)\d+$")
            .expect("static regex")
    })
}

fn boot0_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(mmcblk\d+)boot0$").expect("static regex"))
}

fn mmc_disk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^mmcblk\d+$").expect("static regex"))
}

/// `mmcblk1p2` => `mmcblk1`, `sda2` => `sda`; whole-disk names pass through.
pub fn base_device_name(name: &str) -> String {
    let name = name.trim().trim_start_matches("/dev/");
    // btrfs sources look like `/dev/sda2[/@]`.
    let name = name.split('[').next().unwrap_or(name);
    match partition_suffix_re().captures(name) {
        Some(caps) => caps
            .name("base")
            .or_else(|| caps.name("sd"))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| name.to_string()),
        None => name.to_string(),
    }
}

pub fn is_already_installed(devices: &[String], root_base: &str) -> bool {
    let boot0 = format!("{root_base}boot0");
    devices.iter().any(|d| d == &boot0)
}

/// eMMC disks expose `bootN` hardware partitions; fall back to any other
/// mmc disk that is not the one we booted from.
pub fn find_target(devices: &[String], root_base: &str) -> Option<String> {
    let mut with_boot0: Vec<String> = devices
        .iter()
        .filter_map(|d| boot0_re().captures(d))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    with_boot0.sort();
    with_boot0.dedup();
    if let Some(first) = with_boot0.into_iter().next() {
        return Some(first);
    }

    let mut others: Vec<String> = devices
        .iter()
        .filter(|d| mmc_disk_re().is_match(d) && d.as_str() != root_base)
        .cloned()
        .collect();
    others.sort();
    others.dedup();
    if others.len() > 1 {
        warn!("several storage candidates found ({}); using the first", others.join(", "));
    }
    others.into_iter().next()
}

pub fn header_needs_overload(header: &[u8]) -> bool {
    let Some(word) = header.get(KERNEL_MARKER_OFFSET..KERNEL_MARKER_OFFSET + 2) else {
        return true;
    };
    u16::from_le_bytes([word[0], word[1]]) != KERNEL_OFFSET_PATCH_MARKER
}

pub fn kernel_needs_overload(kernel_image: &Path) -> bool {
    let mut buf = [0u8; KERNEL_HEADER_LEN];
    let read = File::open(kernel_image).and_then(|mut f| {
        let mut n = 0;
        while n < buf.len() {
            let got = f.read(&mut buf[n..])?;
            if got == 0 {
                break;
            }
            n += got;
        }
        Ok(n)
    });
    match read {
        Ok(n) => header_needs_overload(&buf[..n]),
        Err(e) => {
            warn!(
                "cannot read kernel header {}: {e}; assuming bootloader overload is needed",
                kernel_image.display()
            );
            true
        }
    }
}

fn valid_uuid(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    let v = raw.trim();
    uuid::Uuid::parse_str(v).ok().map(|u| u.hyphenated().to_string())
}

pub fn generate_rootfs_uuid(inv: &dyn Inventory) -> Result<String> {
    valid_uuid(inv.kernel_random_uuid())
        .or_else(|| valid_uuid(inv.generated_uuid()))
        .ok_or_else(|| Error::new(ErrorKind::InvalidUuid, "could not generate a rootfs UUID"))
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub release_file: PathBuf,
    pub kernel_image: PathBuf,
    pub filesystem_type: RootFsType,
    pub show_all: bool,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub context: InstallContext,
    pub release: Option<ReleaseValues>,
    pub filter: FamilyFilter,
}

pub fn family_filter(release: Option<&ReleaseValues>, show_all: bool) -> Result<FamilyFilter> {
    if show_all {
        return Ok(FamilyFilter::All);
    }
    let release = release.ok_or_else(|| {
        Error::new(
            ErrorKind::MissingReleaseFile,
            "release file is missing; rerun with the full device list to choose a board",
        )
    })?;
    release
        .family()
        .map(|f| FamilyFilter::Family(f.to_string()))
        .ok_or_else(|| Error::new(ErrorKind::Precondition, "release file has no FAMILY entry"))
}

pub fn resolve(inv: &dyn Inventory, opts: &ResolveOptions) -> Result<Resolution> {
    let source = inv.root_source()?;
    let root_base = base_device_name(&source);
    debug!("root filesystem on {source} (base {root_base})");

    let devices = inv.block_devices()?;
    if is_already_installed(&devices, &root_base) {
        return Err(Error::new(
            ErrorKind::AlreadyInstalled,
            format!("system is already running from eMMC (/dev/{root_base})"),
        ));
    }

    let target = find_target(&devices, &root_base).ok_or_else(|| {
        Error::new(ErrorKind::NoStorageFound, "no eMMC storage device found")
    })?;
    info!("target device: /dev/{target}");

    let release = match ReleaseValues::load(&opts.release_file) {
        Ok(v) => Some(v),
        Err(e) if e.kind() == ErrorKind::MissingReleaseFile && opts.show_all => {
            warn!("{e}; continuing with the full board list");
            None
        }
        Err(e) => return Err(e),
    };
    let filter = family_filter(release.as_ref(), opts.show_all)?;

    let rootfs_uuid = generate_rootfs_uuid(inv)?;
    let need_bootloader_overload = kernel_needs_overload(&opts.kernel_image);
    debug!("rootfs uuid {rootfs_uuid}, overload needed: {need_bootloader_overload}");

    Ok(Resolution {
        context: InstallContext {
            target_device: PathBuf::from(format!("/dev/{target}")),
            root_device_name: root_base,
            rootfs_uuid,
            filesystem_type: opts.filesystem_type,
            need_bootloader_overload,
            external_repartition_used: false,
        },
        release,
        filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_names_strip_partition_suffix() {
        assert_eq!(base_device_name("/dev/mmcblk1p2"), "mmcblk1");
        assert_eq!(base_device_name("/dev/sda2"), "sda");
        assert_eq!(base_device_name("/dev/nvme0n1p3"), "nvme0n1");
        assert_eq!(base_device_name("/dev/sdb1[/@]"), "sdb");
        assert_eq!(base_device_name("mmcblk1"), "mmcblk1");
    }

    #[test]
    fn marker_detection_reads_little_endian_word() {
        let mut header = [0u8; 16];
        header[10] = 0x08;
        header[11] = 0x01;
        assert!(!header_needs_overload(&header));
        header[11] = 0x00;
        assert!(header_needs_overload(&header));
        assert!(header_needs_overload(&header[..8]));
    }

    #[test]
    fn missing_kernel_means_overload() {
        assert!(kernel_needs_overload(Path::new("/nonexistent/zImage")));
    }
}
