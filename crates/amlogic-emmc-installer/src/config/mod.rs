use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/emmc-installer.toml";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::new(
                ErrorKind::Precondition,
                format!("invalid config at '{}' in {}: {e}", path, self.path.display()),
            )
        })?;
        Ok(Some(parsed))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub registry: PathBuf,
    pub release: PathBuf,
    pub source_root: PathBuf,
    pub boot_dir: PathBuf,
    pub kernel_image: PathBuf,
    pub uboot_dir: PathBuf,
    pub backup: PathBuf,
    pub work_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry: "/etc/model_database.conf".into(),
            release: "/etc/ophub-release".into(),
            source_root: "/".into(),
            boot_dir: "/boot".into(),
            kernel_image: "/boot/zImage".into(),
            uboot_dir: "/usr/lib/u-boot".into(),
            backup: "/root/backup-bootloader.img".into(),
            work_dir: "/mnt/emmc-install".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub label: String,
    pub leftovers: Vec<String>,
    pub configs: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            label: "BOOT_EMMC".into(),
            leftovers: vec![
                "System Volume Information".into(),
                "s905_autoscript".into(),
                "s905_autoscript.cmd".into(),
                "aml_autoscript.zip".into(),
                "boot.bmp".into(),
            ],
            configs: vec![
                "uEnv.txt".into(),
                "extlinux/extlinux.conf".into(),
                "armbianEnv.txt".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootfsConfig {
    pub label: String,
    pub copy_dirs: Vec<String>,
    pub installer_artifacts: Vec<String>,
    pub release_template: String,
    pub firmware_dir: String,
    pub mac_prefix: String,
}

impl Default for RootfsConfig {
    fn default() -> Self {
        Self {
            label: "ROOTFS_EMMC".into(),
            copy_dirs: ["etc", "home", "opt", "root", "selinux", "srv", "usr", "var"]
                .into_iter()
                .map(String::from)
                .collect(),
            installer_artifacts: vec![
                "root/backup-bootloader.img".into(),
                "etc/emmc-installer.toml".into(),
            ],
            release_template: "etc/ophub-release".into(),
            firmware_dir: "usr/lib/firmware".into(),
            mac_prefix: "9e:61:76".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmpartConfig {
    pub program: String,
    pub layout: String,
}

impl Default for AmpartConfig {
    fn default() -> Self {
        Self {
            program: "ampart".into(),
            layout: "data::-1:4".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub paths: PathsConfig,
    pub boot: BootConfig,
    pub rootfs: RootfsConfig,
    pub ampart: AmpartConfig,
}

impl InstallerConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: InstallerConfig = doc.deserialize_path("")?.unwrap_or_default();
        crate::storage::rootfs::parse_mac_prefix(&cfg.rootfs.mac_prefix)?;
        Ok(cfg)
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("invalid imports entry in {} (expected string)", path.display()),
            ));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value_inner(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::new(
            ErrorKind::Precondition,
            format!("config import cycle detected at {}", canonical.display()),
        ));
    }

    let data = fs::read_to_string(path).map_err(|e| {
        Error::new(
            ErrorKind::Precondition,
            format!("failed to read config {}: {e}", path.display()),
        )
    })?;
    let mut value: Value = toml::from_str(&data).map_err(|e| {
        Error::new(
            ErrorKind::Precondition,
            format!("TOML parse error in {}: {e}", path.display()),
        )
    })?;

    let mut out = Value::Table(Default::default());
    if let Some(parent) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, parent), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Explicit path must exist; otherwise the default path is used when present.
pub fn load_or_default(explicit: Option<&Path>) -> Result<ConfigDoc> {
    match explicit {
        Some(p) => load(p),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.is_file() {
                load(default)
            } else {
                Ok(ConfigDoc::empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[paths]\nregistry = \"/base/db.conf\"\nwork_dir = \"/base/work\"\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("ampart.toml"),
            "program = \"/opt/ampart\"\n",
        )
        .expect("write import");
        fs::write(
            tmp.path().join("site.toml"),
            "extends = \"base.toml\"\n[paths]\nwork_dir = \"/site/work\"\n[ampart]\nimports = [\"ampart.toml\"]\n",
        )
        .expect("write site");

        let doc = load(&tmp.path().join("site.toml")).expect("load");
        let cfg = InstallerConfig::from_doc(&doc).expect("cfg");
        assert_eq!(cfg.paths.registry, PathBuf::from("/base/db.conf"));
        assert_eq!(cfg.paths.work_dir, PathBuf::from("/site/work"));
        assert_eq!(cfg.ampart.program, "/opt/ampart");
        assert_eq!(cfg.ampart.layout, "data::-1:4");
    }

    #[test]
    fn import_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load(&tmp.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn bad_mac_prefix_is_rejected() {
        let value: Value = toml::from_str("[rootfs]\nmac_prefix = \"00:11:22\"\n").unwrap();
        let doc = ConfigDoc {
            path: PathBuf::from("<mem>"),
            value,
        };
        let err = InstallerConfig::from_doc(&doc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }
}
