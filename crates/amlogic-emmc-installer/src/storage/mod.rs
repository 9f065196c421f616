//! The storage writer: the destructive part of an install, expressed as an
//! ordered pipeline of steps over one exclusively owned device.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::bootloader::{BootloaderKind, BootloaderSource, Candidates};
use crate::error::Result;
use crate::executor::{StageExec, StepRegistry};
use crate::layout::{PartitionPlan, RootFsType};
use crate::pipeline::Pipeline;
use crate::registry::BoardRecord;
use crate::release::ReleaseDescriptor;
use crate::session::InstallSession;

pub mod bootfs;
pub mod mount;
pub mod rootfs;
pub mod steps;

pub const SECTORS_PER_MIB: u64 = 2048;
/// Fixed on this platform; recorded as `DISK_TYPE` in the release file.
pub const DISK_TYPE: &str = "emmc";

pub trait Stage {
    fn id(&self) -> &'static str;
    fn plan(&self, session: &InstallSession, pipeline: &mut Pipeline) -> Result<()>;
}

pub fn builtin_stages() -> Vec<Box<dyn Stage>> {
    vec![Box::new(steps::InstallStage)]
}

pub fn plan_install(session: &InstallSession) -> Result<Pipeline> {
    let mut pipeline = Pipeline::default();
    for stage in builtin_stages() {
        stage.plan(session, &mut pipeline)?;
    }
    Ok(pipeline)
}

pub fn builtin_registry() -> Result<StepRegistry> {
    let mut reg = StepRegistry::default();
    steps::InstallStage::register_steps(&mut reg)?;
    Ok(reg)
}

/// `parted` argument lists: a fresh msdos label, then boot and root.
/// parted end positions are inclusive, so the boot partition ends one
/// sector before its last MiB boundary.
pub fn partition_commands(device: &Path, plan: &PartitionPlan) -> Vec<Vec<String>> {
    let dev = device.display().to_string();
    let (boot_start, boot_end) = plan.boot_range_mib();
    let s = |v: &str| v.to_string();
    vec![
        vec![s("-s"), dev.clone(), s("mklabel"), s("msdos")],
        vec![
            s("-s"),
            dev.clone(),
            s("mkpart"),
            s("primary"),
            s("fat32"),
            format!("{boot_start}MiB"),
            format!("{}s", boot_end * SECTORS_PER_MIB - 1),
        ],
        vec![
            s("-s"),
            dev,
            s("mkpart"),
            s("primary"),
            s(plan.filesystem_type.as_str()),
            format!("{}MiB", plan.root_start_mib()),
            s("100%"),
        ],
    ]
}

pub fn mkfs_root_args(fs: RootFsType, uuid: &str, label: &str, partition: &Path) -> (String, Vec<String>) {
    let part = partition.display().to_string();
    let s = |v: &str| v.to_string();
    match fs {
        RootFsType::Ext4 => (
            s("mkfs.ext4"),
            vec![
                s("-F"),
                s("-q"),
                s("-U"),
                s(uuid),
                s("-L"),
                s(label),
                s("-b"),
                s("4k"),
                s("-m"),
                s("0"),
                part,
            ],
        ),
        RootFsType::Btrfs => (
            s("mkfs.btrfs"),
            vec![
                s("-f"),
                s("-U"),
                s(uuid),
                s("-L"),
                s(label),
                s("-m"),
                s("single"),
                part,
            ],
        ),
    }
}

/// Mount options for the freshly formatted root; btrfs gets its compression
/// from the first mount so copied files land compressed.
pub fn root_mount_options(fs: RootFsType) -> Option<String> {
    match fs {
        RootFsType::Ext4 => None,
        RootFsType::Btrfs => Some(format!("compress=zstd:{}", crate::layout::BTRFS_ZSTD_LEVEL)),
    }
}

/// Partition numbers of `base` in an `lsblk -l -n -o NAME,TYPE` listing, ascending.
pub fn existing_partitions(listing: &str, base: &str) -> Vec<u32> {
    fn part_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"^(?P<base>.+?)p?(?P<n>\d+)$").expect("static regex"))
    }
    let mut out: Vec<u32> = listing
        .lines()
        .filter_map(|l| {
            let mut f = l.split_whitespace();
            let name = f.next()?;
            (f.next()? == "part").then_some(name)
        })
        .filter_map(|name| {
            let c = part_re().captures(name)?;
            (&c["base"] == base).then(|| c["n"].parse().ok()).flatten()
        })
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn uboot_path(uboot_dir: &Path, name: &str) -> PathBuf {
    let p = Path::new(name);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        uboot_dir.join(p)
    }
}

pub fn bootloader_candidates(session: &InstallSession) -> Candidates {
    let board = session.board();
    let dir = &session.config.paths.uboot_dir;
    let mainline = board
        .mainline_uboot_file
        .as_deref()
        .filter(|_| session.options.mainline_uboot)
        .map(|f| uboot_path(dir, f));
    Candidates {
        mainline,
        vendor: board.bootloader_img_file.as_deref().map(|f| uboot_path(dir, f)),
        backup: session.config.paths.backup.clone(),
    }
}

pub fn overload_path(session: &InstallSession) -> Option<PathBuf> {
    if !session.context.need_bootloader_overload {
        return None;
    }
    let file = session.board().uboot_overload_file.as_deref()?;
    Some(uboot_path(&session.config.paths.uboot_dir, file))
}

fn yes_no(v: bool) -> String {
    if v { "yes".into() } else { "no".into() }
}

pub fn descriptor_for(session: &InstallSession) -> ReleaseDescriptor {
    let board = session.board();
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let mainline_used = session
        .bootloader_source
        .as_ref()
        .is_some_and(|s| s.kind == BootloaderKind::Mainline);
    ReleaseDescriptor {
        model_id: board.id.to_string(),
        model_name: board.model.clone(),
        soc: board.soc.clone(),
        fdtfile: board.device_tree_file.clone(),
        mainline_uboot: opt(&board.mainline_uboot_file),
        bootloader_img: opt(&board.bootloader_img_file),
        uboot_overload: opt(&board.uboot_overload_file),
        rootfs_type: session.context.filesystem_type.to_string(),
        boot_conf: opt(&board.boot_conf),
        disk_type: DISK_TYPE.into(),
        mluboot_status: yes_no(mainline_used),
        ampart_status: yes_no(session.context.external_repartition_used),
    }
}

/// Written to the work directory once every step has succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct InstallManifest {
    pub installed_at: String,
    pub target_device: PathBuf,
    pub board: BoardRecord,
    pub manual_board: bool,
    pub plan: PartitionPlan,
    pub filesystem_type: RootFsType,
    pub rootfs_uuid: String,
    pub external_repartition_used: bool,
    pub bootloader: Option<BootloaderSource>,
    pub backup_sha256: Option<String>,
}

impl InstallManifest {
    pub fn from_session(session: &InstallSession) -> Self {
        Self {
            installed_at: chrono::Utc::now().to_rfc3339(),
            target_device: session.context.target_device.clone(),
            board: session.board().clone(),
            manual_board: session.selection.is_manual(),
            plan: session.plan.clone(),
            filesystem_type: session.context.filesystem_type,
            rootfs_uuid: session.context.rootfs_uuid.clone(),
            external_repartition_used: session.context.external_repartition_used,
            bootloader: session.bootloader_source.clone(),
            backup_sha256: session.backup_sha256.clone(),
        }
    }
}
