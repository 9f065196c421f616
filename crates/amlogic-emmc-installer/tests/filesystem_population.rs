use std::fs;
use std::path::Path;

use amlogic_emmc_installer::config::{BootConfig, RootfsConfig};
use amlogic_emmc_installer::layout::RootFsType;
use amlogic_emmc_installer::release::{self, ReleaseDescriptor, ReleaseValues};
use amlogic_emmc_installer::storage::bootfs::{BootPatch, live_device_tree_file, populate_boot};
use amlogic_emmc_installer::storage::rootfs::{RootPatch, populate_root};

const UUID: &str = "3f1c5a2e-8d4b-4a0e-9a57-2c61b0d4e9f1";

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, text).expect("write");
}

#[test]
fn boot_partition_is_copied_and_repointed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let source = tmp.path().join("boot");
    let mount = tmp.path().join("mnt");
    fs::create_dir_all(&mount).expect("mkdir mount");

    write(
        &source.join("uEnv.txt"),
        "LINUX=/zImage\nINITRD=/uInitrd\nFDT=/dtb/amlogic/meson-gxl-s905x-p212.dtb\nAPPEND=root=LABEL=ROOTFS rootfstype=ext4 rootflags=data=writeback rw console=ttyAML0,115200n8\n",
    );
    write(
        &source.join("extlinux/extlinux.conf"),
        "label Armbian\n  kernel /zImage\n  fdt /dtb/amlogic/meson-gxl-s905x-p212.dtb\n  append root=UUID=old rootfstype=ext4 rw\n",
    );
    write(&source.join("boot-emmc.ini"), "emmc variant\n");
    write(&source.join("boot.ini"), "usb variant\n");
    write(&source.join("boot.bmp"), "logo");
    write(&source.join("s905_autoscript"), "script");
    write(&source.join("dtb/amlogic/meson-gxm-tx9-pro.dtb"), "dtb");
    let overload = tmp.path().join("u-boot-zyxq.bin");
    fs::write(&overload, [0xAAu8; 64]).expect("write overload");

    assert_eq!(
        live_device_tree_file(&source, &BootConfig::default().configs).as_deref(),
        Some("meson-gxl-s905x-p212.dtb")
    );

    let patch = BootPatch {
        rootfs_uuid: UUID.into(),
        filesystem_type: RootFsType::Ext4,
        device_tree_file: "meson-gxm-tx9-pro.dtb".into(),
        overload: Some(overload),
    };
    populate_boot(&source, &mount, &BootConfig::default(), &patch).expect("populate");

    let uenv = fs::read_to_string(mount.join("uEnv.txt")).expect("uEnv");
    assert!(uenv.contains("FDT=/dtb/amlogic/meson-gxm-tx9-pro.dtb"));
    assert!(uenv.contains(&format!("root=UUID={UUID} rootfstype=ext4 rootflags=data=writeback")));
    let ext = fs::read_to_string(mount.join("extlinux/extlinux.conf")).expect("extlinux");
    assert!(ext.contains("  fdt /dtb/amlogic/meson-gxm-tx9-pro.dtb"));
    assert!(ext.contains(&format!("root=UUID={UUID}")));

    assert_eq!(
        fs::read_to_string(mount.join("boot.ini")).expect("boot.ini"),
        "emmc variant\n"
    );
    assert!(!mount.join("boot-emmc.ini").exists());
    assert!(!mount.join("boot.bmp").exists());
    assert!(!mount.join("s905_autoscript").exists());
    assert_eq!(fs::read(mount.join("u-boot.ext")).expect("u-boot.ext"), vec![0xAA; 64]);
    assert!(mount.join("u-boot.emmc").is_file());
    // The source is never modified.
    assert!(source.join("boot.bmp").exists());
}

#[cfg(unix)]
#[test]
fn root_partition_gets_layout_fstab_and_fresh_macs() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("tempdir");
    let source = tmp.path().join("src");
    let mount = tmp.path().join("mnt");
    fs::create_dir_all(&mount).expect("mkdir mount");

    write(&source.join("etc/hostname"), "armbian\n");
    write(&source.join("etc/emmc-installer.toml"), "[paths]\n");
    write(&source.join("usr/bin/sh"), "#!");
    write(&source.join("root/backup-bootloader.img"), "backup");
    write(&source.join("root/.profile"), "");
    let nvram = "boardflags=0x0\nmacaddr=00:90:4c:c5:12:38\nccode=CN\n";
    write(&source.join("usr/lib/firmware/brcm/brcmfmac43455-sdio.txt"), nvram);
    std::os::unix::fs::symlink(
        "brcmfmac43455-sdio.txt",
        source.join("usr/lib/firmware/brcm/brcmfmac43455-sdio.phicomm,n1.txt"),
    )
    .expect("symlink");
    write(&source.join("proc/cpuinfo"), "not copied");

    let patch = RootPatch {
        rootfs_uuid: UUID.into(),
        filesystem_type: RootFsType::Ext4,
        boot_label: "BOOT_EMMC".into(),
    };
    populate_root(&source, &mount, &RootfsConfig::default(), &patch).expect("populate");

    assert_eq!(
        fs::read_to_string(mount.join("etc/hostname")).expect("hostname"),
        "armbian\n"
    );
    assert_eq!(
        fs::read_link(mount.join("bin")).expect("bin link"),
        Path::new("usr/bin")
    );
    assert!(mount.join("bin/sh").exists());
    let tmp_mode = fs::metadata(mount.join("tmp")).expect("tmp").permissions().mode();
    assert_eq!(tmp_mode & 0o7777, 0o1777);
    assert!(mount.join("proc").is_dir());
    assert!(!mount.join("proc/cpuinfo").exists());

    let fstab = fs::read_to_string(mount.join("etc/fstab")).expect("fstab");
    assert!(fstab.starts_with(&format!("UUID={UUID}\t/\text4\t")));
    assert!(fstab.contains("LABEL=BOOT_EMMC\t/boot\tvfat"));

    let firmware = mount.join("usr/lib/firmware/brcm");
    let text = fs::read_to_string(firmware.join("brcmfmac43455-sdio.txt")).expect("nvram");
    assert!(text.contains("macaddr=9e:61:76:"));
    assert!(!text.contains("00:90:4c:c5:12:38"));
    assert!(text.starts_with("boardflags=0x0\n") && text.ends_with("ccode=CN\n"));
    assert!(
        fs::symlink_metadata(firmware.join("brcmfmac43455-sdio.phicomm,n1.txt"))
            .expect("link")
            .file_type()
            .is_symlink()
    );

    assert!(!mount.join("root/backup-bootloader.img").exists());
    assert!(!mount.join("etc/emmc-installer.toml").exists());
    assert!(mount.join("root/.profile").exists());
}

#[test]
fn release_descriptor_updates_template_in_place() {
    let tmp = tempfile::tempdir().expect("tempdir");
    write(
        &tmp.path().join("etc/ophub-release"),
        "PLATFORM='amlogic'\nFAMILY='meson-gxm'\nMODEL_ID='999'\nKERNEL_TAGS='stable'\n",
    );
    let descriptor = ReleaseDescriptor {
        model_id: "213".into(),
        model_name: "Tanix TX9 Pro".into(),
        soc: "s912".into(),
        fdtfile: "meson-gxm-tx9-pro.dtb".into(),
        uboot_overload: "u-boot-zyxq.bin".into(),
        rootfs_type: "ext4".into(),
        boot_conf: "uEnv.txt".into(),
        disk_type: "emmc".into(),
        mluboot_status: "no".into(),
        ampart_status: "no".into(),
        ..Default::default()
    };
    release::write(&descriptor, tmp.path(), "etc/ophub-release").expect("write");

    let text = fs::read_to_string(tmp.path().join("etc/ophub-release")).expect("read");
    assert!(text.starts_with("PLATFORM='amlogic'\nFAMILY='meson-gxm'\nMODEL_ID='213'\n"));
    let values = ReleaseValues::load(&tmp.path().join("etc/ophub-release")).expect("load");
    assert_eq!(values.get("KERNEL_TAGS"), Some("stable"));
    assert_eq!(ReleaseDescriptor::from_values(&values), descriptor);
}

#[test]
fn release_write_is_stable_on_rerun() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("etc/ophub-release");
    write(&path, "PLATFORM='amlogic'\nSOC='s905x'\nBUILD_DATE='2024-01-01'\n");
    let descriptor = ReleaseDescriptor {
        model_id: "305".into(),
        model_name: "Mibox 3".into(),
        soc: "s905l3a".into(),
        fdtfile: "meson-g12a-s905l3a-e900v22c.dtb".into(),
        rootfs_type: "btrfs".into(),
        disk_type: "emmc".into(),
        mluboot_status: "no".into(),
        ampart_status: "yes".into(),
        ..Default::default()
    };

    release::write(&descriptor, tmp.path(), "etc/ophub-release").expect("first write");
    let first = fs::read(&path).expect("read first");
    release::write(&descriptor, tmp.path(), "etc/ophub-release").expect("second write");
    let second = fs::read(&path).expect("read second");

    assert_eq!(first, second);
    let text = String::from_utf8(first).expect("utf8");
    assert_eq!(text.matches("MODEL_ID=").count(), 1);
    assert!(text.contains("BUILD_DATE='2024-01-01'\n"));
    assert!(text.ends_with("AMPART_STATUS='yes'\n"));
}
