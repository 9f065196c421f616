//! The `KEY='value'` release descriptor kept in the root filesystem.
//!
//! The running system's copy tells us which board family we booted on; the
//! installed copy records what was resolved for the eMMC install.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub const KEY_MODEL_ID: &str = "MODEL_ID";
pub const KEY_MODEL_NAME: &str = "MODEL_NAME";
pub const KEY_FAMILY: &str = "FAMILY";

/// Keys the writer owns; everything else in the template is left alone.
pub const DESCRIPTOR_KEYS: [&str; 12] = [
    "MODEL_ID",
    "MODEL_NAME",
    "SOC",
    "FDTFILE",
    "MAINLINE_UBOOT",
    "BOOTLOADER_IMG",
    "UBOOT_OVERLOAD",
    "ROOTFS_TYPE",
    "BOOT_CONF",
    "DISK_TYPE",
    "MLUBOOT_STATUS",
    "AMPART_STATUS",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub model_id: String,
    pub model_name: String,
    pub soc: String,
    pub fdtfile: String,
    pub mainline_uboot: String,
    pub bootloader_img: String,
    pub uboot_overload: String,
    pub rootfs_type: String,
    pub boot_conf: String,
    pub disk_type: String,
    pub mluboot_status: String,
    pub ampart_status: String,
}

impl ReleaseDescriptor {
    pub fn pairs(&self) -> [(&'static str, &str); 12] {
        [
            ("MODEL_ID", self.model_id.as_str()),
            ("MODEL_NAME", self.model_name.as_str()),
            ("SOC", self.soc.as_str()),
            ("FDTFILE", self.fdtfile.as_str()),
            ("MAINLINE_UBOOT", self.mainline_uboot.as_str()),
            ("BOOTLOADER_IMG", self.bootloader_img.as_str()),
            ("UBOOT_OVERLOAD", self.uboot_overload.as_str()),
            ("ROOTFS_TYPE", self.rootfs_type.as_str()),
            ("BOOT_CONF", self.boot_conf.as_str()),
            ("DISK_TYPE", self.disk_type.as_str()),
            ("MLUBOOT_STATUS", self.mluboot_status.as_str()),
            ("AMPART_STATUS", self.ampart_status.as_str()),
        ]
    }

    pub fn from_values(values: &ReleaseValues) -> Self {
        let get = |k: &str| values.get(k).unwrap_or_default().to_string();
        Self {
            model_id: get("MODEL_ID"),
            model_name: get("MODEL_NAME"),
            soc: get("SOC"),
            fdtfile: get("FDTFILE"),
            mainline_uboot: get("MAINLINE_UBOOT"),
            bootloader_img: get("BOOTLOADER_IMG"),
            uboot_overload: get("UBOOT_OVERLOAD"),
            rootfs_type: get("ROOTFS_TYPE"),
            boot_conf: get("BOOT_CONF"),
            disk_type: get("DISK_TYPE"),
            mluboot_status: get("MLUBOOT_STATUS"),
            ampart_status: get("AMPART_STATUS"),
        }
    }
}

/// All `KEY=value` pairs of a descriptor file, quotes removed.
#[derive(Debug, Clone, Default)]
pub struct ReleaseValues {
    values: BTreeMap<String, String>,
}

impl ReleaseValues {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            if let Some((key, raw)) = split_assignment(line) {
                values.insert(key.to_string(), unquote(raw));
            }
        }
        Self { values }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::MissingReleaseFile
            } else {
                ErrorKind::Precondition
            };
            Error::new(
                kind,
                format!("failed to read release file {}: {e}", path.display()),
            )
        })?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn family(&self) -> Option<&str> {
        self.get(KEY_FAMILY)
    }

    pub fn model_id(&self) -> Option<u32> {
        self.get(KEY_MODEL_ID).and_then(|v| v.parse().ok())
    }
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((key, value))
}

fn unquote(raw: &str) -> String {
    let v = raw.trim();
    if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
        v[1..v.len() - 1].replace("'\\''", "'")
    } else if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Replace the owned keys in `template`, appending any the template lacks.
pub fn render(template: &str, descriptor: &ReleaseDescriptor) -> String {
    let pairs = descriptor.pairs();
    let mut written = [false; 12];
    let mut out = String::with_capacity(template.len() + 256);

    for line in template.lines() {
        let owned = split_assignment(line)
            .and_then(|(key, _)| pairs.iter().position(|(k, _)| *k == key));
        match owned {
            Some(idx) => {
                let (key, value) = pairs[idx];
                out.push_str(&format!("{key}={}", quote(value)));
                written[idx] = true;
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    for (idx, (key, value)) in pairs.iter().enumerate() {
        if !written[idx] {
            out.push_str(&format!("{key}={}\n", quote(value)));
        }
    }
    out
}

/// Update the descriptor at `mount_root/template_rel` in place.
pub fn write(descriptor: &ReleaseDescriptor, mount_root: &Path, template_rel: &str) -> Result<()> {
    let path = mount_root.join(template_rel.trim_start_matches('/'));
    let template = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("release template {} missing; creating it", path.display());
            String::new()
        }
        Err(e) => {
            return Err(Error::new(
                ErrorKind::WriteFailed,
                format!("failed to read release template {}: {e}", path.display()),
            ));
        }
    };
    let rendered = render(&template, descriptor);

    let dir = path.parent().unwrap_or(mount_root);
    crate::util::ensure_dir(dir).map_err(|e| e.with_kind(ErrorKind::WriteFailed))?;
    let write_failed = |e: std::io::Error| {
        Error::new(
            ErrorKind::WriteFailed,
            format!("failed to write release file {}: {e}", path.display()),
        )
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_failed)?;
    tmp.write_all(rendered.as_bytes()).map_err(write_failed)?;
    tmp.as_file().sync_all().map_err(write_failed)?;
    tmp.persist(&path).map_err(|e| write_failed(e.error))?;
    tracing::info!("release descriptor written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_quotes_and_skips_comments() {
        let v = ReleaseValues::parse(
            "# comment\nMODEL_ID='213'\nFAMILY=\"meson-gxm\"\nPLATFORM=amlogic\nBROKEN LINE\n",
        );
        assert_eq!(v.model_id(), Some(213));
        assert_eq!(v.family(), Some("meson-gxm"));
        assert_eq!(v.get("PLATFORM"), Some("amlogic"));
        assert_eq!(v.get("BROKEN LINE"), None);
    }

    #[test]
    fn render_replaces_known_keys_only() {
        let d = ReleaseDescriptor {
            model_id: "101".into(),
            rootfs_type: "btrfs".into(),
            ..Default::default()
        };
        let out = render("PLATFORM='amlogic'\nMODEL_ID='1'\nROOTFS_TYPE='ext4'\n", &d);
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("PLATFORM='amlogic'"));
        assert_eq!(lines.next(), Some("MODEL_ID='101'"));
        assert_eq!(lines.next(), Some("ROOTFS_TYPE='btrfs'"));
        assert!(out.contains("AMPART_STATUS=''"));
    }

    #[test]
    fn embedded_quote_survives_round_trip() {
        let d = ReleaseDescriptor {
            model_name: "Box 'Pro'".into(),
            ..Default::default()
        };
        let parsed = ReleaseValues::parse(&render("", &d));
        assert_eq!(parsed.get("MODEL_NAME"), Some("Box 'Pro'"));
    }
}
