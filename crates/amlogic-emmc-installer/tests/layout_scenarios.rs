use amlogic_emmc_installer::layout::{LayoutInput, RootFsType, plan};
use amlogic_emmc_installer::registry::Registry;

const REGISTRY: &str = "\
213:Tanix-TX9-Pro:s912:meson-gxm-tx9-pro.dtb:u-boot-zyxq.bin:NA:NA:3G/32G:stable:amlogic:meson-gxm:uEnv.txt:NA:tx9-pro:yes
305:CM311-1a:s905l3a:meson-g12a-s905l3a-cm311.dtb:NA:NA:NA:2G/16G:stable:amlogic:meson-g12a:uEnv.txt:NA:cm311:yes
510:Generic-Box:s905w:meson-gxl-s905w-p281.dtb:NA:NA:NA:1G/8G:stable:amlogic:meson-gxl:uEnv.txt:NA:p281:yes
";

fn geometry_for(id: u32, external: bool) -> (u64, u64, u64) {
    let reg = Registry::parse(REGISTRY).expect("registry");
    let board = reg.lookup(id).expect("board");
    let p = plan(&LayoutInput::for_board(board, external), RootFsType::Ext4);
    (p.blank1_mib, p.boot_size_mib, p.blank2_mib)
}

#[test]
fn tx9_pro_batch_uses_its_measured_offsets() {
    assert_eq!(geometry_for(213, false), (700, 512, 220));
}

#[test]
fn cm311_batch_beats_the_generic_s905l3a_rule() {
    assert_eq!(geometry_for(305, false), (108, 512, 778));
}

#[test]
fn unknown_board_gets_the_default_plan() {
    assert_eq!(geometry_for(510, false), (68, 512, 770));
}

#[test]
fn ampart_layout_overrides_board_offsets() {
    for id in [213, 305, 510] {
        assert_eq!(geometry_for(id, true), (117, 512, 0), "board {id}");
    }
}

#[test]
fn btrfs_plan_carries_compression_options() {
    let reg = Registry::parse(REGISTRY).expect("registry");
    let board = reg.lookup(510).expect("board");
    let p = plan(&LayoutInput::for_board(board, false), RootFsType::Btrfs);
    assert_eq!(p.filesystem_type, RootFsType::Btrfs);
    assert!(p.root_mount_options.contains("compress=zstd:6"));
    assert_eq!(p.root_start_mib(), 68 + 512 + 770);
}
