use std::path::PathBuf;

use serde::Serialize;

use crate::bootloader::BootloaderSource;
use crate::config::InstallerConfig;
use crate::layout::{LayoutInput, PartitionPlan, RootFsType};
use crate::registry::BoardRecord;

/// Per-invocation state established by the device resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallContext {
    pub target_device: PathBuf,
    pub root_device_name: String,
    pub rootfs_uuid: String,
    pub filesystem_type: RootFsType,
    pub need_bootloader_overload: bool,
    pub external_repartition_used: bool,
}

impl InstallContext {
    /// `/dev/mmcblk2` + 1 => `/dev/mmcblk2p1`.
    pub fn partition_path(&self, index: u32) -> PathBuf {
        let dev = self.target_device.to_string_lossy();
        let sep = if dev.ends_with(|c: char| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        };
        PathBuf::from(format!("{dev}{sep}{index}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BoardSelection {
    Lookup(BoardRecord),
    Manual(BoardRecord),
}

impl BoardSelection {
    pub fn board(&self) -> &BoardRecord {
        match self {
            BoardSelection::Lookup(b) | BoardSelection::Manual(b) => b,
        }
    }

    pub fn board_mut(&mut self) -> &mut BoardRecord {
        match self {
            BoardSelection::Lookup(b) | BoardSelection::Manual(b) => b,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, BoardSelection::Manual(_))
    }
}

/// Operator choices that are not board data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub mainline_uboot: bool,
    pub ampart: bool,
}

/// Everything the install steps read and update while they run.
#[derive(Debug, Clone)]
pub struct InstallSession {
    pub config: InstallerConfig,
    pub context: InstallContext,
    pub selection: BoardSelection,
    pub options: InstallOptions,
    pub plan: PartitionPlan,
    pub bootloader_source: Option<BootloaderSource>,
    pub backup_sha256: Option<String>,
}

impl InstallSession {
    pub fn new(
        config: InstallerConfig,
        context: InstallContext,
        selection: BoardSelection,
        options: InstallOptions,
    ) -> Self {
        let plan = crate::layout::plan(
            &LayoutInput::for_board(selection.board(), context.external_repartition_used),
            context.filesystem_type,
        );
        Self {
            config,
            context,
            selection,
            options,
            plan,
            bootloader_source: None,
            backup_sha256: None,
        }
    }

    pub fn board(&self) -> &BoardRecord {
        self.selection.board()
    }

    pub fn ampart_requested(&self) -> bool {
        self.options.ampart
    }

    /// Recompute the plan once the external repartition outcome is known.
    pub fn replan(&mut self) -> &PartitionPlan {
        self.plan = crate::layout::plan(
            &LayoutInput::for_board(self.board(), self.context.external_repartition_used),
            self.context.filesystem_type,
        );
        &self.plan
    }

    pub fn boot_partition(&self) -> PathBuf {
        self.context.partition_path(1)
    }

    pub fn root_partition(&self) -> PathBuf {
        self.context.partition_path(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dev: &str) -> InstallContext {
        InstallContext {
            target_device: dev.into(),
            root_device_name: "sda".into(),
            rootfs_uuid: "u".into(),
            filesystem_type: RootFsType::Ext4,
            need_bootloader_overload: false,
            external_repartition_used: false,
        }
    }

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(ctx("/dev/mmcblk2").partition_path(1), PathBuf::from("/dev/mmcblk2p1"));
        assert_eq!(ctx("/dev/sdb").partition_path(2), PathBuf::from("/dev/sdb2"));
    }
}
