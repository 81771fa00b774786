// End-to-end tests for the exFAT engine over in-memory volumes.

mod common;

use common::*;
use silt_core::{FsError, MemDevice};
use silt_filesystems::{FatType, FatVolume, MountOptions, OpenMode};

/// Surface the engine's log output when running with RUST_LOG set.
fn init_logging() {
    env_logger::try_init().ok();
}

/// 8 MiB, 4 KiB clusters.
fn exfat_volume() -> FatVolume<MemDevice> {
    init_logging();
    mount_image(build_exfat_image(16384, 3))
}

#[test]
fn image_builder_mounts_as_exfat() {
    let mut vol = exfat_volume();
    assert_eq!(vol.fat_type(), Some(FatType::ExFat));
    let stats = vol.statvol().unwrap();
    assert_eq!(stats.cluster_size, 4096);
    assert!(stats.free_clusters > 0);
}

#[test]
fn fragmented_bitmap_is_rejected_at_mount() {
    init_logging();
    let mut img = build_exfat_image(16384, 3);
    // Corrupt the bitmap chain: point it somewhere non-contiguous.
    let fat = 24 * SS; // fat_offset fixed by the builder
    img[fat + 2 * 4..fat + 2 * 4 + 4].copy_from_slice(&100u32.to_le_bytes());
    let dev = MemDevice::from_bytes(img, SS);
    let mut vol = FatVolume::new(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.mount().unwrap_err(), FsError::NoFilesystem);
}

#[test]
fn create_write_close_reopen_read() {
    let mut vol = exfat_volume();
    let data: Vec<u8> = (0u32..100_000).map(|i| (i % 253) as u8).collect();

    let mut fh = vol
        .open("/big file with a long name.dat", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &data).unwrap();
    vol.close(&mut fh).unwrap();

    let mut fh = vol
        .open("/big file with a long name.dat", OpenMode::READ)
        .unwrap();
    assert_eq!(fh.size(), data.len() as u64);
    let mut back = vec![0u8; data.len()];
    assert_eq!(vol.read(&mut fh, &mut back).unwrap(), data.len());
    assert_eq!(back, data);
    vol.close(&mut fh).unwrap();
}

#[test]
fn lookup_is_case_insensitive_via_name_hash() {
    let mut vol = exfat_volume();
    let mut fh = vol
        .open("/MixedCase.TXT", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut fh).unwrap();

    vol.stat("/mixedcase.txt").unwrap();
    vol.stat("/MIXEDCASE.txt").unwrap();
    // But the stored name keeps its case.
    let mut dh = vol.opendir("/").unwrap();
    let fi = vol.readdir(&mut dh).unwrap().expect("one entry");
    assert_eq!(fi.name, "MixedCase.TXT");
    assert_eq!(fi.alt_name, ""); // exFAT has no short names
    vol.closedir(&mut dh).unwrap();
}

#[test]
fn interleaved_writes_fragment_both_files() {
    let mut vol = exfat_volume();
    let free0 = vol.getfree().unwrap();

    // Two files written in interleaved 16 KiB (4-cluster) bursts.
    let mut a = vol.open("/A", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    let mut b = vol.open("/B", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    for round in 0u8..8 {
        vol.write(&mut a, &vec![round; 16 * 1024]).unwrap();
        vol.write(&mut b, &vec![round ^ 0xFF; 16 * 1024]).unwrap();
    }
    vol.close(&mut a).unwrap();
    vol.close(&mut b).unwrap();

    // 32 clusters each.
    assert_eq!(vol.getfree().unwrap(), free0 - 64);

    // Both chains must now live on the FAT (the back-fill ran); reading
    // after remount exercises exactly those links.
    vol.mount().unwrap();
    for (name, seed) in [("/A", 0u8), ("/B", 0xFFu8)] {
        let mut fh = vol.open(name, OpenMode::READ).unwrap();
        assert_eq!(fh.size(), 128 * 1024);
        let mut back = vec![0u8; 128 * 1024];
        assert_eq!(vol.read(&mut fh, &mut back).unwrap(), back.len());
        for round in 0u8..8 {
            let at = round as usize * 16 * 1024;
            assert_eq!(back[at], round ^ seed, "{name} burst {round}");
        }
        // A fragmented chain maps to more than one run.
        let runs = vol.create_link_map(&mut fh).unwrap();
        assert_eq!(runs, 8, "{name} should carry 8 fragments");
        vol.close(&mut fh).unwrap();
    }
}

#[test]
fn contiguous_file_stays_contiguous() {
    let mut vol = exfat_volume();
    let mut fh = vol
        .open("/solo", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &vec![7u8; 64 * 1024]).unwrap();
    vol.close(&mut fh).unwrap();

    vol.mount().unwrap();
    let mut fh = vol.open("/solo", OpenMode::READ).unwrap();
    let runs = vol.create_link_map(&mut fh).unwrap();
    assert_eq!(runs, 1, "a lone writer must produce one extent");
    let mut back = vec![0u8; 64 * 1024];
    vol.read(&mut fh, &mut back).unwrap();
    assert!(back.iter().all(|&b| b == 7));
    vol.close(&mut fh).unwrap();
}

#[test]
fn unlink_reclaims_bitmap_space() {
    let mut vol = exfat_volume();
    let free0 = vol.getfree().unwrap();

    let mut fh = vol.open("/junk", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, &vec![0u8; 40 * 1024]).unwrap(); // 10 clusters
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0 - 10);

    vol.unlink("/junk").unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);
    assert_eq!(vol.stat("/junk").unwrap_err(), FsError::NoFile);
}

#[test]
fn directories_and_rename() {
    let mut vol = exfat_volume();
    vol.mkdir("/photos").unwrap();
    vol.mkdir("/photos/2023 summer").unwrap();

    let mut fh = vol
        .open("/photos/2023 summer/beach.jpg", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, b"not really a jpeg").unwrap();
    vol.close(&mut fh).unwrap();

    vol.rename("/photos/2023 summer/beach.jpg", "/photos/best.jpg").unwrap();
    assert_eq!(
        vol.stat("/photos/2023 summer/beach.jpg").unwrap_err(),
        FsError::NoFile
    );
    let fi = vol.stat("/photos/best.jpg").unwrap();
    assert_eq!(fi.size, 17);

    // The emptied directory can go; the populated one cannot.
    vol.rmdir("/photos/2023 summer").unwrap();
    assert_eq!(vol.rmdir("/photos").unwrap_err(), FsError::Denied);
}

#[test]
fn entry_sets_survive_remount() {
    let mut vol = exfat_volume();
    let mut fh = vol
        .open("/persistent name that spans several entries.bin", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &vec![0xABu8; 5000]).unwrap();
    vol.close(&mut fh).unwrap();

    vol.mount().unwrap();
    let fi = vol.stat("/persistent name that spans several entries.bin").unwrap();
    assert_eq!(fi.size, 5000);
    assert_eq!(fi.name, "persistent name that spans several entries.bin");
}

#[test]
fn share_table_applies_to_exfat_objects() {
    let mut vol = exfat_volume();
    let mut w = vol.open("/locked", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    assert_eq!(vol.open("/locked", OpenMode::READ).unwrap_err(), FsError::Locked);
    assert_eq!(vol.unlink("/locked").unwrap_err(), FsError::Locked);
    vol.close(&mut w).unwrap();
    vol.unlink("/locked").unwrap();
}

#[test]
fn truncate_updates_entry_set() {
    let mut vol = exfat_volume();
    let mut fh = vol
        .open("/shrink", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &vec![1u8; 20 * 1024]).unwrap();
    vol.lseek(&mut fh, 4096).unwrap();
    vol.truncate(&mut fh).unwrap();
    vol.close(&mut fh).unwrap();

    let fi = vol.stat("/shrink").unwrap();
    assert_eq!(fi.size, 4096);
}

#[test]
fn volume_label_round_trip() {
    let mut vol = exfat_volume();
    assert_eq!(vol.getlabel().unwrap(), "");
    vol.setlabel("Backup 2024").unwrap(); // exFAT labels keep their case
    assert_eq!(vol.getlabel().unwrap(), "Backup 2024");
    vol.setlabel("").unwrap();
    assert_eq!(vol.getlabel().unwrap(), "");
}

#[test]
fn chdir_tracks_path_for_getcwd() {
    let mut vol = exfat_volume();
    vol.mkdir("/work").unwrap();
    vol.mkdir("/work/deep").unwrap();
    vol.chdir("/work/deep").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/work/deep");

    // Relative operations resolve against the tracked directory.
    let mut fh = vol.open("here.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();
    vol.stat("/work/deep/here.txt").unwrap();

    vol.chdir("/").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/");
}
