use std::path::{Component, Path, PathBuf};

use crate::config::{InstallerConfig, PathsConfig};
use crate::error::{Error, ErrorKind, Result};

/// Where the installer mounts partitions and leaves its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallWorkspace {
    pub root: PathBuf,
    pub boot_mount: PathBuf,
    pub root_mount: PathBuf,
    pub manifest: PathBuf,
}

pub const MANIFEST_FILE: &str = "install-manifest.json";

pub fn load_paths(cfg: &PathsConfig) -> Result<InstallWorkspace> {
    let root = cfg.work_dir.clone();
    if !root.is_absolute() {
        return Err(Error::new(
            ErrorKind::Precondition,
            format!("work_dir '{}' must be absolute", root.display()),
        ));
    }
    if root.parent().is_none() {
        return Err(Error::new(
            ErrorKind::Precondition,
            "work_dir must not be the filesystem root",
        ));
    }
    Ok(InstallWorkspace {
        boot_mount: root.join("boot"),
        root_mount: root.join("root"),
        manifest: root.join(MANIFEST_FILE),
        root,
    })
}

/// Joins a config-supplied path onto a mount point; a leading `/` is
/// dropped and `..` is refused so nothing escapes the mount.
pub fn resolve_under(base: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim().trim_start_matches('/');
    if rel.is_empty() {
        return Err(Error::new(ErrorKind::Precondition, "empty relative path"));
    }
    if Path::new(rel)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::new(
            ErrorKind::Precondition,
            format!("invalid relative path '{rel}' (contains '..')"),
        ));
    }
    Ok(base.join(rel))
}

/// Checks every path in the `[boot]` and `[rootfs]` sections up front, before
/// anything is written to the device.
pub fn validate_relative_paths(cfg: &InstallerConfig) -> Result<()> {
    let probe = Path::new("/");
    let boot = cfg.boot.leftovers.iter().chain(&cfg.boot.configs);
    let rootfs = cfg
        .rootfs
        .copy_dirs
        .iter()
        .chain(&cfg.rootfs.installer_artifacts)
        .chain([&cfg.rootfs.release_template, &cfg.rootfs.firmware_dir]);
    for rel in boot.chain(rootfs) {
        resolve_under(probe, rel)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_layout_under_work_dir() {
        let ws = load_paths(&PathsConfig::default()).expect("paths");
        assert_eq!(ws.boot_mount, PathBuf::from("/mnt/emmc-install/boot"));
        assert_eq!(ws.root_mount, PathBuf::from("/mnt/emmc-install/root"));
        assert_eq!(ws.manifest, PathBuf::from("/mnt/emmc-install/install-manifest.json"));

        let relative = PathsConfig {
            work_dir: "mnt".into(),
            ..Default::default()
        };
        assert!(load_paths(&relative).is_err());
        let slash = PathsConfig {
            work_dir: "/".into(),
            ..Default::default()
        };
        assert!(load_paths(&slash).is_err());
    }

    #[test]
    fn relative_paths_stay_inside_base() {
        let base = Path::new("/mnt/root");
        assert_eq!(
            resolve_under(base, "/etc/ophub-release").expect("ok"),
            PathBuf::from("/mnt/root/etc/ophub-release")
        );
        assert!(resolve_under(base, "../etc").is_err());
        assert!(resolve_under(base, " ").is_err());
        assert!(validate_relative_paths(&InstallerConfig::default()).is_ok());
    }
}
