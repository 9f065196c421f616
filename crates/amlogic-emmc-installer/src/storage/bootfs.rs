//! Boot partition content: copied from the running system, then pointed at
//! the new root filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use tracing::{debug, info, warn};

use crate::config::BootConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::layout::{BTRFS_ZSTD_LEVEL, RootFsType};
use crate::session::BoardSelection;
use crate::util;
use crate::workspace::resolve_under;

/// Names the overload bootloader is staged under.
pub const OVERLOAD_ALIASES: [&str; 2] = ["u-boot.ext", "u-boot.emmc"];

/// Values substituted into the copied boot configuration.
#[derive(Debug, Clone)]
pub struct BootPatch {
    pub rootfs_uuid: String,
    pub filesystem_type: RootFsType,
    pub device_tree_file: String,
    /// Absolute path of the overload binary, when the kernel needs one.
    pub overload: Option<PathBuf>,
}

fn root_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(root|rootdev)=\S+").expect("static regex"))
}

fn rootfstype_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\brootfstype=\S+").expect("static regex"))
}

fn rootflags_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\brootflags=\S+").expect("static regex"))
}

fn fdt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?P<key>\s*(?:FDT=|fdt\s+|fdtfile=)(?:\S*/)?)(?P<dtb>[^/\s]+\.dtb)")
            .expect("static regex")
    })
}

fn emmc_variant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<stem>.+)-emmc\.(?P<ext>[^.]+)$").expect("static regex"))
}

fn rootflags_for(fs: RootFsType) -> String {
    match fs {
        RootFsType::Ext4 => "rootflags=data=writeback".into(),
        RootFsType::Btrfs => format!("rootflags=compress=zstd:{BTRFS_ZSTD_LEVEL}"),
    }
}

/// Rewrites root, filesystem and device-tree references in one config file.
pub fn rewrite_boot_config(text: &str, patch: &BootPatch) -> String {
    let uuid = &patch.rootfs_uuid;
    let out = root_re().replace_all(text, |c: &regex::Captures<'_>| {
        format!("{}=UUID={uuid}", &c[1])
    });
    let fstype = format!("rootfstype={}", patch.filesystem_type);
    let out = rootfstype_re().replace_all(&out, NoExpand(&fstype));
    let flags = rootflags_for(patch.filesystem_type);
    let out = rootflags_re().replace_all(&out, NoExpand(&flags));
    let dtb = &patch.device_tree_file;
    fdt_re()
        .replace_all(&out, |c: &regex::Captures<'_>| format!("{}{dtb}", &c["key"]))
        .into_owned()
}

/// Device-tree filename referenced by the first boot config that names one.
pub fn device_tree_in(text: &str) -> Option<String> {
    fdt_re()
        .captures(text)
        .map(|c| c["dtb"].to_string())
}

pub fn live_device_tree_file(boot_dir: &Path, configs: &[String]) -> Option<String> {
    configs.iter().find_map(|rel| {
        let text = fs::read_to_string(resolve_under(boot_dir, rel).ok()?).ok()?;
        device_tree_in(&text)
    })
}

/// The live boot configuration wins over the registry for looked-up boards.
pub fn prefer_live_device_tree(selection: &mut BoardSelection, live: Option<&str>) {
    let Some(live) = live.filter(|s| !s.is_empty()) else {
        return;
    };
    if selection.is_manual() {
        return;
    }
    let board = selection.board_mut();
    if board.device_tree_file != live {
        warn!(
            "registry device tree {} differs from live boot config {live}; using {live}",
            board.device_tree_file
        );
        board.device_tree_file = live.to_string();
    }
}

fn remove_leftovers(root: &Path, leftovers: &[String]) -> Result<()> {
    for name in leftovers {
        let removed = util::remove_any(&resolve_under(root, name)?)
            .map_err(|e| e.with_kind(ErrorKind::Copy))?;
        if removed {
            debug!("removed {name}");
        }
    }
    Ok(())
}

fn rename_emmc_variants(root: &Path) -> Result<()> {
    let entries = fs::read_dir(root)
        .map_err(|e| Error::new(ErrorKind::Copy, format!("failed to list {}: {e}", root.display())))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(c) = emmc_variant_re().captures(&name) else {
            continue;
        };
        let canonical = format!("{}.{}", &c["stem"], &c["ext"]);
        let to = root.join(&canonical);
        fs::rename(entry.path(), &to).map_err(|e| {
            Error::new(
                ErrorKind::Copy,
                format!("failed to rename {name} to {canonical}: {e}"),
            )
        })?;
        info!("{name} -> {canonical}");
    }
    Ok(())
}

fn stage_overload(root: &Path, overload: &Path) -> Result<()> {
    for alias in OVERLOAD_ALIASES {
        util::copy_file(overload, &root.join(alias))?;
    }
    Ok(())
}

/// Fills a freshly formatted boot partition mounted at `mount`.
pub fn populate_boot(source: &Path, mount: &Path, cfg: &BootConfig, patch: &BootPatch) -> Result<()> {
    util::copy_tree(source, mount)?;
    remove_leftovers(mount, &cfg.leftovers)?;
    rename_emmc_variants(mount)?;

    for rel in &cfg.configs {
        let path = resolve_under(mount, rel)?;
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let rewritten = rewrite_boot_config(&text, patch);
        if rewritten != text {
            util::write_text(&path, &rewritten).map_err(|e| e.with_kind(ErrorKind::Copy))?;
            info!("updated {rel}");
        }
    }

    if let Some(overload) = patch.overload.as_deref() {
        stage_overload(mount, overload)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> BootPatch {
        BootPatch {
            rootfs_uuid: "1b4e28ba-2fa1-11d2-883f-0016d3cca427".into(),
            filesystem_type: RootFsType::Btrfs,
            device_tree_file: "meson-gxm-tx9-pro.dtb".into(),
            overload: None,
        }
    }

    #[test]
    fn rewrites_uenv_and_extlinux() {
        let uenv = "LINUX=/zImage\nFDT=/dtb/amlogic/meson-gxl-s905x-p212.dtb\nAPPEND=root=LABEL=ROOTFS rootfstype=ext4 rootflags=data=writeback rw\n";
        let got = rewrite_boot_config(uenv, &patch());
        assert!(got.contains("FDT=/dtb/amlogic/meson-gxm-tx9-pro.dtb"));
        assert!(got.contains("root=UUID=1b4e28ba-2fa1-11d2-883f-0016d3cca427 rootfstype=btrfs"));
        assert!(got.contains("rootflags=compress=zstd:6"));

        let ext = "  fdt /dtb/amlogic/old.dtb\n  append root=UUID=old rootfstype=ext4\n";
        let got = rewrite_boot_config(ext, &patch());
        assert!(got.contains("  fdt /dtb/amlogic/meson-gxm-tx9-pro.dtb"));
        assert!(got.contains("root=UUID=1b4e28ba"));

        let armbian = "rootdev=UUID=old\nfdtfile=amlogic/old.dtb\n";
        let got = rewrite_boot_config(armbian, &patch());
        assert_eq!(
            got,
            "rootdev=UUID=1b4e28ba-2fa1-11d2-883f-0016d3cca427\nfdtfile=amlogic/meson-gxm-tx9-pro.dtb\n"
        );
    }

    #[test]
    fn live_config_overrides_lookup_only() {
        let board = crate::registry::BoardRecord {
            id: 11,
            device_tree_file: "registry.dtb".into(),
            ..Default::default()
        };
        let mut lookup = BoardSelection::Lookup(board.clone());
        prefer_live_device_tree(&mut lookup, Some("live.dtb"));
        assert_eq!(lookup.board().device_tree_file, "live.dtb");

        let mut manual = BoardSelection::Manual(board);
        prefer_live_device_tree(&mut manual, Some("live.dtb"));
        assert_eq!(manual.board().device_tree_file, "registry.dtb");
    }

    #[test]
    fn device_tree_found_in_uenv() {
        assert_eq!(
            device_tree_in("FDT=/dtb/amlogic/x.dtb\n").as_deref(),
            Some("x.dtb")
        );
        assert_eq!(device_tree_in("fdtdir /dtb\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_leftover_removal_is_a_copy_error() {
        let err = remove_leftovers(Path::new("/proc/self"), &["status".to_string()])
            .expect_err("procfs entries cannot be unlinked");
        assert_eq!(err.kind(), ErrorKind::Copy);
    }
}
