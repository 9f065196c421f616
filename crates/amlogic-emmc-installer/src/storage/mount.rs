//! Scoped mounts of the target's partitions.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::util;

/// One mount owned by the install. `unmount` is the success path; dropping a
/// still-mounted guard lazily force-unmounts so no failure path leaves it behind.
#[derive(Debug)]
pub struct MountGuard {
    source: PathBuf,
    target: PathBuf,
    mounted: bool,
}

impl MountGuard {
    pub fn mount(
        ctx: &ExecCtx,
        source: &Path,
        target: &Path,
        options: Option<&str>,
    ) -> Result<Self> {
        if !ctx.dry_run {
            util::ensure_dir(target).map_err(|e| e.with_kind(ErrorKind::Format))?;
        }
        let mut cmd = Command::new("mount");
        if let Some(o) = options {
            cmd.arg("-o").arg(o);
        }
        cmd.arg(source).arg(target);
        ctx.run_cmd(cmd).map_err(|e| e.with_kind(ErrorKind::Format))?;
        Ok(Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            mounted: !ctx.dry_run,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    pub fn unmount(mut self, ctx: &ExecCtx) -> Result<()> {
        let mut cmd = Command::new("umount");
        cmd.arg(&self.target);
        let res = ctx.run_cmd(cmd);
        if res.is_ok() {
            self.mounted = false;
        }
        res
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        warn!(
            "force-unmounting {} from {}",
            self.source.display(),
            self.target.display()
        );
        let _ = Command::new("umount")
            .arg("-f")
            .arg("-l")
            .arg(&self.target)
            .status();
    }
}

/// Mount points of `device` listed in a `/proc/mounts`-style table.
pub fn mount_points_of(mounts: &str, device: &Path) -> Vec<PathBuf> {
    let dev = device.to_string_lossy();
    let mut out: Vec<PathBuf> = mounts
        .lines()
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            let src = fields.next()?;
            let dst = fields.next()?;
            (src == dev).then(|| PathBuf::from(unescape_mount_path(dst)))
        })
        .collect();
    // Nested mounts first.
    out.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
    out
}

fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

const MOUNT_TABLE: &str = "/proc/mounts";

fn read_mount_table(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::new(
            ErrorKind::Precondition,
            format!("cannot read mount table {}: {e}", path.display()),
        )
    })
}

/// Releases any existing mount of `device` before it is reformatted.
pub fn force_unmount(ctx: &ExecCtx, device: &Path) -> Result<()> {
    let mounts = read_mount_table(Path::new(MOUNT_TABLE))?;
    let points = mount_points_of(&mounts, device);
    if points.is_empty() {
        debug!("{} is not mounted", device.display());
        return Ok(());
    }
    for p in points {
        let mut cmd = Command::new("umount");
        cmd.arg("-f").arg(&p);
        ctx.run_cmd(cmd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_mount_of_a_device() {
        let table = "\
/dev/mmcblk2p1 /mnt/a vfat rw 0 0
/dev/sda2 / ext4 rw 0 0
/dev/mmcblk2p1 /mnt/with\\040space vfat rw 0 0
/dev/mmcblk2p1 /mnt/a/nested vfat rw 0 0
";
        let got = mount_points_of(table, Path::new("/dev/mmcblk2p1"));
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], PathBuf::from("/mnt/a/nested"));
        assert!(got.contains(&PathBuf::from("/mnt/with space")));
        assert!(mount_points_of(table, Path::new("/dev/mmcblk2p2")).is_empty());
    }

    #[test]
    fn unreadable_mount_table_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = read_mount_table(&tmp.path().join("mounts")).expect_err("missing table");
        assert_eq!(err.kind(), ErrorKind::Precondition);
        std::fs::write(tmp.path().join("mounts"), "/dev/sda2 / ext4 rw 0 0\n").expect("write");
        assert!(read_mount_table(&tmp.path().join("mounts")).expect("read").contains("/dev/sda2"));
    }

    #[test]
    fn dry_run_guard_does_not_claim_a_mount() {
        let (tx, rx) = std::sync::mpsc::channel();
        let ctx = ExecCtx::new(true, std::sync::Arc::new(crate::executor::ChannelSink::new(tx)));
        let guard = MountGuard::mount(
            &ctx,
            Path::new("/dev/mmcblk2p2"),
            Path::new("/nonexistent/root"),
            Some("compress=zstd:6"),
        )
        .expect("mount");
        assert!(!guard.mounted);
        guard.unmount(&ctx).expect("unmount");
        let lines: Vec<String> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                crate::executor::ExecEvent::StepLog { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(
            lines,
            [
                "DRY-RUN: mount -o compress=zstd:6 /dev/mmcblk2p2 /nonexistent/root",
                "DRY-RUN: umount /nonexistent/root",
            ]
        );
    }
}
