//! Bootloader placement on the raw eMMC.
//!
//! The boot ROM loads from sector 1 onward; bytes 444..512 of sector 0 hold
//! the MBR disk signature and partition table we just created, so only the
//! 444-byte boot code region of sector 0 is overwritten.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub const MBR_BOOT_CODE_LEN: u64 = 444;
pub const SECTOR_SIZE: u64 = 512;
/// Size of the pre-install backup taken from the start of the device.
pub const BACKUP_LEN: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    Mainline,
    Vendor,
    Backup,
}

/// A copy from `src_offset` in the image to `dst_offset` on the device;
/// `len == None` copies to the end of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub len: Option<u64>,
}

const TWO_PASS: &[ByteRange] = &[
    ByteRange {
        src_offset: 0,
        dst_offset: 0,
        len: Some(MBR_BOOT_CODE_LEN),
    },
    ByteRange {
        src_offset: SECTOR_SIZE,
        dst_offset: SECTOR_SIZE,
        len: None,
    },
];

/// Sources in priority order with the ranges each one writes.
pub const PROTOCOL: &[(BootloaderKind, &[ByteRange])] = &[
    (BootloaderKind::Mainline, TWO_PASS),
    (BootloaderKind::Vendor, TWO_PASS),
    (BootloaderKind::Backup, TWO_PASS),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootloaderSource {
    pub kind: BootloaderKind,
    pub path: PathBuf,
}

impl BootloaderSource {
    pub fn ranges(&self) -> &'static [ByteRange] {
        PROTOCOL
            .iter()
            .find(|(k, _)| *k == self.kind)
            .map(|(_, r)| *r)
            .unwrap_or(TWO_PASS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Candidates {
    /// Only set when the operator asked for mainline u-boot.
    pub mainline: Option<PathBuf>,
    pub vendor: Option<PathBuf>,
    pub backup: PathBuf,
}

impl Candidates {
    fn path_for(&self, kind: BootloaderKind) -> Option<&Path> {
        match kind {
            BootloaderKind::Mainline => self.mainline.as_deref().filter(|p| p.is_file()),
            BootloaderKind::Vendor => self.vendor.as_deref().filter(|p| p.is_file()),
            BootloaderKind::Backup => Some(self.backup.as_path()),
        }
    }
}

/// The backup always qualifies, so selection never comes up empty.
pub fn select(candidates: &Candidates) -> BootloaderSource {
    for (kind, _) in PROTOCOL {
        if let Some(path) = candidates.path_for(*kind) {
            return BootloaderSource {
                kind: *kind,
                path: path.to_path_buf(),
            };
        }
    }
    BootloaderSource {
        kind: BootloaderKind::Backup,
        path: candidates.backup.clone(),
    }
}

fn copy_range(src: &mut File, dst: &mut File, range: &ByteRange) -> io::Result<u64> {
    src.seek(SeekFrom::Start(range.src_offset))?;
    dst.seek(SeekFrom::Start(range.dst_offset))?;
    match range.len {
        Some(len) => io::copy(&mut src.take(len), dst),
        None => io::copy(src, dst),
    }
}

pub fn write_to_device(source: &BootloaderSource, device: &Path) -> Result<u64> {
    let failed = |what: &str, e: io::Error| {
        Error::new(
            ErrorKind::BootloaderWrite,
            format!(
                "failed to {what} writing {} to {}: {e}",
                source.path.display(),
                device.display()
            ),
        )
    };
    let mut src = File::open(&source.path).map_err(|e| failed("open image", e))?;
    let mut dst = OpenOptions::new()
        .write(true)
        .truncate(false)
        .open(device)
        .map_err(|e| failed("open device", e))?;

    let mut total = 0;
    for range in source.ranges() {
        total += copy_range(&mut src, &mut dst, range).map_err(|e| failed("copy", e))?;
    }
    dst.flush().map_err(|e| failed("flush", e))?;
    dst.sync_all().map_err(|e| failed("sync", e))?;
    Ok(total)
}

/// Copy the first [`BACKUP_LEN`] bytes of `device` to `backup`.
pub fn backup_device_head(device: &Path, backup: &Path) -> Result<u64> {
    let failed = |e: io::Error| {
        Error::new(
            ErrorKind::Backup,
            format!(
                "failed to back up {} to {}: {e}",
                device.display(),
                backup.display()
            ),
        )
    };
    if let Some(parent) = backup.parent() {
        crate::util::ensure_dir(parent).map_err(|e| e.with_kind(ErrorKind::Backup))?;
    }
    let src = File::open(device).map_err(failed)?;
    let mut dst = File::create(backup).map_err(failed)?;
    let copied = io::copy(&mut src.take(BACKUP_LEN), &mut dst).map_err(failed)?;
    dst.sync_all().map_err(failed)?;
    if copied < SECTOR_SIZE {
        return Err(Error::new(
            ErrorKind::Backup,
            format!("backup of {} is only {copied} bytes", device.display()),
        ));
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn mainline_only_when_requested_and_present() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mainline = tmp.path().join("u-boot-mainline.bin");
        let vendor = tmp.path().join("vendor.img");
        let backup = tmp.path().join("backup.img");
        fs::write(&vendor, b"v").expect("vendor");

        let c = Candidates {
            mainline: Some(mainline.clone()),
            vendor: Some(vendor.clone()),
            backup: backup.clone(),
        };
        assert_eq!(select(&c).kind, BootloaderKind::Vendor);

        fs::write(&mainline, b"m").expect("mainline");
        assert_eq!(select(&c).kind, BootloaderKind::Mainline);

        let no_request = Candidates {
            mainline: None,
            vendor: None,
            backup,
        };
        assert_eq!(select(&no_request).kind, BootloaderKind::Backup);
    }

    #[test]
    fn two_pass_write_preserves_partition_table() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let image = tmp.path().join("u-boot.bin");
        let device = tmp.path().join("disk.img");
        fs::write(&image, vec![0xAA; 2048]).expect("image");
        fs::write(&device, vec![0x55; 4096]).expect("device");

        let src = BootloaderSource {
            kind: BootloaderKind::Vendor,
            path: image,
        };
        let written = write_to_device(&src, &device).expect("write");
        assert_eq!(written, 444 + (2048 - 512));

        let disk = fs::read(&device).expect("read disk");
        assert!(disk[..444].iter().all(|b| *b == 0xAA));
        assert!(disk[444..512].iter().all(|b| *b == 0x55));
        assert!(disk[512..2048].iter().all(|b| *b == 0xAA));
        assert!(disk[2048..].iter().all(|b| *b == 0x55));
        assert_eq!(disk.len(), 4096);
    }

    #[test]
    fn backup_copies_device_head() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let device = tmp.path().join("disk.img");
        fs::write(&device, vec![7u8; 8192]).expect("device");
        let backup = tmp.path().join("nested/backup.img");
        assert_eq!(backup_device_head(&device, &backup).expect("backup"), 8192);
        assert_eq!(fs::read(&backup).expect("read").len(), 8192);
    }
}
