use std::process::Command;

use amlogic_emmc_installer_macros::{Stage, Step};
use tracing::info;

use crate::bootloader::{self, BACKUP_LEN};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::session::InstallSession;
use crate::storage::bootfs::{self, BootPatch};
use crate::storage::mount::{MountGuard, force_unmount};
use crate::storage::rootfs::{self, RootPatch};
use crate::{ampart, release, util, workspace};

fn ampart_requested(session: &InstallSession) -> bool {
    session.ampart_requested()
}

fn device_base_name(session: &InstallSession) -> String {
    session
        .context
        .target_device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[Step(
    id = "install.backup",
    stage = "install",
    phase = "backup",
    provides = ["device:backed-up"],
    label = "Back up bootloader area"
)]
pub struct BackupStep;

impl BackupStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let device = session.context.target_device.clone();
        let backup = session.config.paths.backup.clone();
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: copy first {BACKUP_LEN} bytes of {} to {}",
                device.display(),
                backup.display()
            ));
            return Ok(());
        }
        let n = bootloader::backup_device_head(&device, &backup)?;
        let sha = util::sha256_file_hex(&backup).map_err(|e| e.with_kind(ErrorKind::Backup))?;
        ctx.log(&format!("saved {n} bytes to {} (sha256 {sha})", backup.display()));
        session.backup_sha256 = Some(sha);
        Ok(())
    }
}

#[Step(
    id = "install.wipe",
    stage = "install",
    phase = "wipe",
    after = ["device:backed-up"],
    provides = ["device:wiped"],
    label = "Remove existing partitions"
)]
pub struct WipeStep;

impl WipeStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let device = session.context.target_device.clone();
        let mut lsblk = Command::new("lsblk");
        lsblk.args(["-l", "-n", "-o", "NAME,TYPE"]).arg(&device);
        let listing = ctx
            .run_capture(lsblk)
            .map_err(|e| e.with_kind(ErrorKind::Wipe))?;
        let parts = crate::storage::existing_partitions(&listing, &device_base_name(session));
        if parts.is_empty() {
            ctx.log("no existing partitions");
        }
        for n in parts {
            let part = session.context.partition_path(n);
            force_unmount(ctx, &part).map_err(|e| e.with_kind(ErrorKind::Wipe))?;
            let mut rm = Command::new("parted");
            rm.arg("-s").arg(&device).arg("rm").arg(n.to_string());
            ctx.run_cmd(rm).map_err(|e| e.with_kind(ErrorKind::Wipe))?;
        }
        Ok(())
    }
}

#[Step(
    id = "install.ampart",
    stage = "install",
    phase = "relayout",
    after = ["device:wiped"],
    provides = ["device:relaid"],
    label = "Relayout with ampart",
    when = ampart_requested
)]
pub struct AmpartStep;

impl AmpartStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = session.config.ampart.clone();
        let device = session.context.target_device.display().to_string();
        let outcome = ampart::repartition(&*ctx, &cfg.program, &device, &cfg.layout);
        ctx.log(&format!("ampart outcome: {outcome:?}"));
        session.context.external_repartition_used = outcome.applied();
        Ok(())
    }
}

#[Step(
    id = "install.layout",
    stage = "install",
    phase = "plan",
    after = ["device:wiped", "device:relaid?"],
    provides = ["plan:final"],
    label = "Finalise partition plan"
)]
pub struct LayoutStep;

impl LayoutStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let plan = session.replan();
        ctx.log(&format!("partition plan: {plan}"));
        Ok(())
    }
}

#[Step(
    id = "install.partition",
    stage = "install",
    phase = "partition",
    after = ["plan:final"],
    provides = ["device:partitioned"],
    label = "Write partition table"
)]
pub struct PartitionStep;

impl PartitionStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let cmds = crate::storage::partition_commands(&session.context.target_device, &session.plan);
        for args in cmds {
            let mut cmd = Command::new("parted");
            cmd.args(args);
            ctx.run_cmd(cmd)
                .map_err(|e| e.with_kind(ErrorKind::Partition))?;
        }
        Ok(())
    }
}

#[Step(
    id = "install.bootloader",
    stage = "install",
    phase = "bootloader",
    after = ["device:partitioned"],
    provides = ["device:bootloader"],
    label = "Write bootloader"
)]
pub struct BootloaderStep;

impl BootloaderStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let source = bootloader::select(&crate::storage::bootloader_candidates(session));
        let device = session.context.target_device.clone();
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: write {:?} bootloader {} to {}",
                source.kind,
                source.path.display(),
                device.display()
            ));
        } else {
            let n = bootloader::write_to_device(&source, &device)?;
            ctx.log(&format!("wrote {n} bytes from {}", source.path.display()));
        }
        session.bootloader_source = Some(source);
        Ok(())
    }
}

#[Step(
    id = "install.bootfs",
    stage = "install",
    phase = "boot",
    after = ["device:bootloader"],
    provides = ["fs:boot"],
    label = "Format and populate boot partition"
)]
pub struct BootFsStep;

impl BootFsStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let ws = workspace::load_paths(&session.config.paths)?;
        let part = session.boot_partition();
        let cfg = session.config.boot.clone();

        force_unmount(ctx, &part).map_err(|e| e.with_kind(ErrorKind::Format))?;
        let mut mkfs = Command::new("mkfs.vfat");
        mkfs.args(["-F", "32", "-n"]).arg(&cfg.label).arg(&part);
        ctx.run_cmd(mkfs).map_err(|e| e.with_kind(ErrorKind::Format))?;

        let overload = crate::storage::overload_path(session);
        if session.context.need_bootloader_overload && overload.is_none() {
            ctx.log("kernel needs a bootloader overload but the board lists none");
        }
        let patch = BootPatch {
            rootfs_uuid: session.context.rootfs_uuid.clone(),
            filesystem_type: session.context.filesystem_type,
            device_tree_file: session.board().device_tree_file.clone(),
            overload,
        };

        let guard = MountGuard::mount(ctx, &part, &ws.boot_mount, None)?;
        let source = session.config.paths.boot_dir.clone();
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: copy {} to {} and patch {}",
                source.display(),
                guard.path().display(),
                cfg.configs.join(", ")
            ));
        } else {
            bootfs::populate_boot(&source, guard.path(), &cfg, &patch)?;
        }
        guard.unmount(ctx).map_err(|e| e.with_kind(ErrorKind::Format))
    }
}

#[Step(
    id = "install.rootfs",
    stage = "install",
    phase = "root",
    after = ["fs:boot"],
    provides = ["fs:root"],
    label = "Format and populate root partition"
)]
pub struct RootFsStep;

impl RootFsStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let ws = workspace::load_paths(&session.config.paths)?;
        let part = session.root_partition();
        let cfg = session.config.rootfs.clone();
        let fs = session.context.filesystem_type;
        let uuid = session.context.rootfs_uuid.clone();

        force_unmount(ctx, &part).map_err(|e| e.with_kind(ErrorKind::Format))?;
        let (program, args) = crate::storage::mkfs_root_args(fs, &uuid, &cfg.label, &part);
        let mut mkfs = Command::new(program);
        mkfs.args(args);
        ctx.run_cmd(mkfs).map_err(|e| e.with_kind(ErrorKind::Format))?;

        let options = crate::storage::root_mount_options(fs);
        let guard = MountGuard::mount(ctx, &part, &ws.root_mount, options.as_deref())?;
        let source = session.config.paths.source_root.clone();
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: copy {} from {} to {}",
                cfg.copy_dirs.join(", "),
                source.display(),
                guard.path().display()
            ));
        } else {
            let patch = RootPatch {
                rootfs_uuid: uuid,
                filesystem_type: fs,
                boot_label: session.config.boot.label.clone(),
            };
            rootfs::populate_root(&source, guard.path(), &cfg, &patch)?;
        }
        guard.unmount(ctx).map_err(|e| e.with_kind(ErrorKind::Copy))
    }
}

#[Step(
    id = "install.release",
    stage = "install",
    phase = "release",
    after = ["fs:root"],
    provides = ["fs:release"],
    label = "Write release descriptor"
)]
pub struct ReleaseStep;

impl ReleaseStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let ws = workspace::load_paths(&session.config.paths)?;
        let part = session.root_partition();
        let descriptor = crate::storage::descriptor_for(session);
        let template = session.config.rootfs.release_template.clone();
        let options = crate::storage::root_mount_options(session.context.filesystem_type);

        let guard = MountGuard::mount(ctx, &part, &ws.root_mount, options.as_deref())
            .map_err(|e| e.with_kind(ErrorKind::WriteFailed))?;
        if ctx.dry_run {
            for (k, v) in descriptor.pairs() {
                ctx.log(&format!("DRY-RUN: {k}='{v}'"));
            }
        } else {
            release::write(&descriptor, guard.path(), &template)?;
        }
        guard
            .unmount(ctx)
            .map_err(|e| e.with_kind(ErrorKind::WriteFailed))
    }
}

#[Step(
    id = "install.manifest",
    stage = "install",
    phase = "manifest",
    after = ["fs:release"],
    label = "Record install manifest"
)]
pub struct ManifestStep;

impl ManifestStep {
    pub fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> Result<()> {
        let ws = workspace::load_paths(&session.config.paths)?;
        let manifest = crate::storage::InstallManifest::from_session(session);
        let value = serde_json::to_value(&manifest)
            .map_err(|e| Error::new(ErrorKind::WriteFailed, format!("json encode error: {e}")))?;
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: write {}", ws.manifest.display()));
            return Ok(());
        }
        util::write_json_pretty(&ws.manifest, &value).map_err(|e| e.with_kind(ErrorKind::WriteFailed))?;
        info!("manifest written to {}", ws.manifest.display());
        Ok(())
    }
}

#[Stage(
    id = "install",
    steps = [
        BackupStep,
        WipeStep,
        AmpartStep,
        LayoutStep,
        PartitionStep,
        BootloaderStep,
        BootFsStep,
        RootFsStep,
        ReleaseStep,
        ManifestStep
    ]
)]
pub struct InstallStage;
