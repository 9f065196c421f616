//! Partition geometry for the eMMC.
//!
//! Amlogic vendor firmware keeps reserved regions (env, logo, dtb, key
//! partitions) at board-specific offsets inside the first gigabyte of the
//! eMMC. Writing over them bricks some batches, so the gaps before the boot
//! partition (`blank1`) and between boot and root (`blank2`) come from
//! community measurements. Rules are evaluated top to bottom; the first
//! match wins and the generic default always matches last.

use std::fmt;

use serde::Serialize;

use crate::registry::BoardRecord;

pub const BTRFS_ZSTD_LEVEL: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootFsType {
    Ext4,
    Btrfs,
}

impl RootFsType {
    pub fn as_str(self) -> &'static str {
        match self {
            RootFsType::Ext4 => "ext4",
            RootFsType::Btrfs => "btrfs",
        }
    }

    pub fn mount_options(self) -> String {
        match self {
            RootFsType::Ext4 => "defaults,noatime,errors=remount-ro".into(),
            RootFsType::Btrfs => format!("defaults,noatime,compress=zstd:{BTRFS_ZSTD_LEVEL}"),
        }
    }
}

impl fmt::Display for RootFsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(blank1, boot, blank2)` in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub blank1_mib: u64,
    pub boot_size_mib: u64,
    pub blank2_mib: u64,
}

const fn geometry(blank1_mib: u64, boot_size_mib: u64, blank2_mib: u64) -> Geometry {
    Geometry {
        blank1_mib,
        boot_size_mib,
        blank2_mib,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// ampart relaid the eMMC into its single `data` partition snapshot.
    ExternalRepartition,
    SocAndIds {
        soc: &'static str,
        ids: &'static [u32],
    },
    Soc(&'static str),
    DeviceTree(&'static str),
    Always,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub when: Match,
    pub geometry: Geometry,
}

/// Inputs the rule chain is allowed to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutInput {
    pub soc: String,
    pub board_id: u32,
    pub device_tree_file: String,
    pub external_repartition_used: bool,
}

impl LayoutInput {
    pub fn for_board(board: &BoardRecord, external_repartition_used: bool) -> Self {
        Self {
            soc: board.soc.clone(),
            board_id: board.id,
            device_tree_file: board.device_tree_file.clone(),
            external_repartition_used,
        }
    }
}

impl Match {
    fn matches(&self, input: &LayoutInput) -> bool {
        match self {
            Match::ExternalRepartition => input.external_repartition_used,
            Match::SocAndIds { soc, ids } => {
                input.soc.eq_ignore_ascii_case(soc) && ids.contains(&input.board_id)
            }
            Match::Soc(soc) => input.soc.eq_ignore_ascii_case(soc),
            Match::DeviceTree(dtb) => input.device_tree_file == *dtb,
            Match::Always => true,
        }
    }
}

pub const DEFAULT_GEOMETRY: Geometry = geometry(68, 512, 770);

pub const RULES: &[Rule] = &[
    Rule {
        name: "ampart-single-data",
        when: Match::ExternalRepartition,
        geometry: geometry(117, 512, 0),
    },
    Rule {
        name: "skyworth-lb2004",
        when: Match::DeviceTree("meson-sm1-skyworth-lb2004-a4091.dtb"),
        geometry: geometry(108, 512, 562),
    },
    Rule {
        name: "s912-tx9-pro-batch",
        when: Match::SocAndIds {
            soc: "s912",
            ids: &[212, 213],
        },
        geometry: geometry(700, 512, 220),
    },
    Rule {
        name: "s905l3a-cm311-batch",
        when: Match::SocAndIds {
            soc: "s905l3a",
            ids: &[305, 306],
        },
        geometry: geometry(108, 512, 778),
    },
    Rule {
        name: "s905l3a",
        when: Match::Soc("s905l3a"),
        geometry: geometry(128, 512, 720),
    },
    Rule {
        name: "s905l3b",
        when: Match::Soc("s905l3b"),
        geometry: geometry(128, 513, 720),
    },
    Rule {
        name: "s905x",
        when: Match::Soc("s905x"),
        geometry: geometry(700, 512, 0),
    },
    Rule {
        name: "generic",
        when: Match::Always,
        geometry: DEFAULT_GEOMETRY,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub rule: &'static str,
    pub blank1_mib: u64,
    pub boot_size_mib: u64,
    pub blank2_mib: u64,
    pub filesystem_type: RootFsType,
    pub root_mount_options: String,
}

impl PartitionPlan {
    pub fn geometry(&self) -> Geometry {
        geometry(self.blank1_mib, self.boot_size_mib, self.blank2_mib)
    }

    /// `[start, end)` of the boot partition in MiB.
    pub fn boot_range_mib(&self) -> (u64, u64) {
        (self.blank1_mib, self.blank1_mib + self.boot_size_mib)
    }

    pub fn root_start_mib(&self) -> u64 {
        self.blank1_mib + self.boot_size_mib + self.blank2_mib
    }
}

impl fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blank1={}MiB boot={}MiB blank2={}MiB root@{}MiB fs={} rule={}",
            self.blank1_mib,
            self.boot_size_mib,
            self.blank2_mib,
            self.root_start_mib(),
            self.filesystem_type,
            self.rule
        )
    }
}

pub fn select_rule<'a>(rules: &'a [Rule], input: &LayoutInput) -> Option<&'a Rule> {
    rules.iter().find(|r| r.when.matches(input))
}

/// Pure: the same input always yields the same plan.
pub fn plan(input: &LayoutInput, filesystem_type: RootFsType) -> PartitionPlan {
    let (rule, g) = match select_rule(RULES, input) {
        Some(r) => (r.name, r.geometry),
        None => ("generic", DEFAULT_GEOMETRY),
    };
    PartitionPlan {
        rule,
        blank1_mib: g.blank1_mib,
        boot_size_mib: g.boot_size_mib,
        blank2_mib: g.blank2_mib,
        filesystem_type,
        root_mount_options: filesystem_type.mount_options(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(soc: &str, id: u32, dtb: &str, ext: bool) -> LayoutInput {
        LayoutInput {
            soc: soc.into(),
            board_id: id,
            device_tree_file: dtb.into(),
            external_repartition_used: ext,
        }
    }

    #[test]
    fn chain_ends_with_a_catch_all() {
        let last = RULES.last().expect("rules");
        assert_eq!(last.when, Match::Always);
        assert_eq!(last.geometry, DEFAULT_GEOMETRY);
    }

    #[test]
    fn only_s905l3b_uses_a_513_boot_partition() {
        for r in RULES {
            if r.name == "s905l3b" {
                assert_eq!(r.geometry.boot_size_mib, 513);
            } else {
                assert_eq!(r.geometry.boot_size_mib, 512, "{}", r.name);
            }
        }
    }

    #[test]
    fn soc_match_ignores_case() {
        let p = plan(&input("S905X", 9, "x.dtb", false), RootFsType::Ext4);
        assert_eq!(p.rule, "s905x");
    }

    #[test]
    fn soc_and_id_rule_precedes_soc_rule() {
        let specific = plan(&input("s905l3a", 305, "x.dtb", false), RootFsType::Ext4);
        let general = plan(&input("s905l3a", 999, "x.dtb", false), RootFsType::Ext4);
        assert_eq!(specific.rule, "s905l3a-cm311-batch");
        assert_eq!(general.rule, "s905l3a");
    }

    #[test]
    fn filesystem_only_changes_mount_options() {
        let i = input("s912", 213, "x.dtb", false);
        let a = plan(&i, RootFsType::Ext4);
        let b = plan(&i, RootFsType::Btrfs);
        assert_eq!(a.geometry(), b.geometry());
        assert!(b.root_mount_options.contains("compress=zstd:6"));
        assert!(a.root_mount_options.contains("errors=remount-ro"));
    }
}
