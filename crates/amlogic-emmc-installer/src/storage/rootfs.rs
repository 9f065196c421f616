//! Root partition content.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::RootfsConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::layout::RootFsType;
use crate::util;
use crate::workspace::resolve_under;

/// Top-level compatibility links for merged-/usr systems.
pub const COMPAT_SYMLINKS: [(&str, &str); 3] =
    [("bin", "usr/bin"), ("lib", "usr/lib"), ("sbin", "usr/sbin")];

/// Mount points created empty on the new root.
pub const EMPTY_DIRS: [&str; 8] = ["boot", "dev", "media", "mnt", "proc", "run", "sys", "tmp"];

/// Three colon-separated hex octets with the locally-administered bit set
/// and the multicast bit clear.
pub fn parse_mac_prefix(raw: &str) -> Result<[u8; 3]> {
    let bad = |why: &str| {
        Error::new(
            ErrorKind::Precondition,
            format!("invalid MAC prefix '{raw}': {why}"),
        )
    };
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(bad("expected three octets"));
    }
    let mut out = [0u8; 3];
    for (slot, part) in out.iter_mut().zip(&parts) {
        if part.len() != 2 {
            return Err(bad("octets must be two hex digits"));
        }
        *slot = u8::from_str_radix(part, 16).map_err(|_| bad("not hexadecimal"))?;
    }
    if out[0] & 0x02 == 0 {
        return Err(bad("not locally administered"));
    }
    if out[0] & 0x01 != 0 {
        return Err(bad("multicast bit set"));
    }
    Ok(out)
}

pub fn random_mac(prefix: [u8; 3]) -> String {
    let noise = uuid::Uuid::new_v4();
    let b = noise.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        prefix[0], prefix[1], prefix[2], b[0], b[1], b[2]
    )
}

fn macaddr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^macaddr=.*$").expect("static regex"))
}

pub fn fstab(uuid: &str, fs: RootFsType, boot_label: &str) -> String {
    let root_pass = match fs {
        RootFsType::Ext4 => 1,
        RootFsType::Btrfs => 0,
    };
    format!(
        "UUID={uuid}\t/\t{fs}\t{opts}\t0 {root_pass}\n\
         LABEL={boot_label}\t/boot\tvfat\tdefaults\t0 2\n\
         tmpfs\t/tmp\ttmpfs\tdefaults,nosuid\t0 0\n",
        opts = fs.mount_options(),
    )
}

/// Gives every wireless firmware descriptor under `firmware` a fresh address.
/// Symlinked descriptors share their target's file and are skipped.
pub fn regenerate_macs(firmware: &Path, prefix: [u8; 3]) -> Result<usize> {
    if !firmware.is_dir() {
        return Ok(0);
    }
    let mut changed = 0;
    for entry in walkdir::WalkDir::new(firmware).follow_links(false) {
        let entry = entry.map_err(|e| Error::new(ErrorKind::Copy, format!("walkdir error: {e}")))?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some("txt")
        {
            continue;
        }
        let Ok(text) = fs::read_to_string(entry.path()) else {
            continue;
        };
        if !macaddr_re().is_match(&text) {
            continue;
        }
        let line = format!("macaddr={}", random_mac(prefix));
        let updated = macaddr_re().replace_all(&text, regex::NoExpand(&line));
        util::write_text(entry.path(), &updated).map_err(|e| e.with_kind(ErrorKind::Copy))?;
        debug!("new {line} in {}", entry.path().display());
        changed += 1;
    }
    Ok(changed)
}

#[cfg(unix)]
fn link(target: &str, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, at)
}

#[cfg(not(unix))]
fn link(_target: &str, _at: &Path) -> std::io::Result<()> {
    Ok(())
}

fn create_layout(mount: &Path) -> Result<()> {
    for d in EMPTY_DIRS {
        util::ensure_dir(&mount.join(d)).map_err(|e| e.with_kind(ErrorKind::Copy))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(mount.join("tmp"), fs::Permissions::from_mode(0o1777))
            .map_err(|e| Error::new(ErrorKind::Copy, format!("failed to chmod /tmp: {e}")))?;
    }
    for (name, target) in COMPAT_SYMLINKS {
        let at = mount.join(name);
        util::remove_any(&at).map_err(|e| e.with_kind(ErrorKind::Copy))?;
        link(target, &at).map_err(|e| {
            Error::new(
                ErrorKind::Copy,
                format!("failed to link {name} -> {target}: {e}"),
            )
        })?;
    }
    Ok(())
}

/// Values that end up in the new root's mount table.
#[derive(Debug, Clone)]
pub struct RootPatch {
    pub rootfs_uuid: String,
    pub filesystem_type: RootFsType,
    pub boot_label: String,
}

/// Fills a freshly formatted root partition mounted at `mount` from `source`.
pub fn populate_root(source: &Path, mount: &Path, cfg: &RootfsConfig, patch: &RootPatch) -> Result<()> {
    let prefix = parse_mac_prefix(&cfg.mac_prefix)?;

    create_layout(mount)?;
    for dir in &cfg.copy_dirs {
        let from = resolve_under(source, dir)?;
        if !from.is_dir() {
            warn!("{} not found, skipping", from.display());
            continue;
        }
        let files = util::copy_tree(&from, &resolve_under(mount, dir)?)?;
        info!("copied /{dir} ({files} files)");
    }

    let fstab_path = mount.join("etc/fstab");
    util::write_text(
        &fstab_path,
        &fstab(&patch.rootfs_uuid, patch.filesystem_type, &patch.boot_label),
    )
    .map_err(|e| e.with_kind(ErrorKind::Copy))?;

    let n = regenerate_macs(&resolve_under(mount, &cfg.firmware_dir)?, prefix)?;
    if n > 0 {
        info!("regenerated {n} firmware MAC address(es)");
    }

    for rel in &cfg.installer_artifacts {
        util::remove_any(&resolve_under(mount, rel)?).map_err(|e| e.with_kind(ErrorKind::Copy))?;
    }
    Ok(())
}
