// End-to-end tests for the FAT12/16/32 engine over in-memory volumes.

mod common;

use common::*;
use silt_core::{FsError, MemDevice};
use silt_filesystems::{FatType, FatVolume, MountOptions, OpenMode};

/// Surface the engine's log output when running with RUST_LOG set.
fn init_logging() {
    env_logger::try_init().ok();
}

/// 64 MiB, 512-byte clusters: enough clusters to classify as FAT32.
fn fat32_volume() -> FatVolume<MemDevice> {
    init_logging();
    mount_image(build_fat_image(131072, 1, true))
}

/// 8 MiB, 1 KiB clusters: FAT16.
fn fat16_volume() -> FatVolume<MemDevice> {
    init_logging();
    mount_image(build_fat_image(16384, 2, false))
}

/// 2 MiB, 512-byte clusters: FAT12.
fn fat12_volume() -> FatVolume<MemDevice> {
    init_logging();
    mount_image(build_fat_image(4096, 1, false))
}

#[test]
fn image_builders_classify_as_expected() {
    assert_eq!(fat32_volume().fat_type(), Some(FatType::Fat32));
    assert_eq!(fat16_volume().fat_type(), Some(FatType::Fat16));
    assert_eq!(fat12_volume().fat_type(), Some(FatType::Fat12));
}

#[test]
fn create_write_close_reopen_read() {
    let mut vol = fat32_volume();

    let data = vec![0xA5u8; 16384];
    let mut fh = vol
        .open("/a.bin", OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
        .unwrap();
    assert_eq!(vol.write(&mut fh, &data).unwrap(), 16384);
    vol.close(&mut fh).unwrap();

    let mut fh = vol.open("/a.bin", OpenMode::READ).unwrap();
    assert_eq!(fh.size(), 16384);
    let mut back = vec![0u8; 16384];
    assert_eq!(vol.read(&mut fh, &mut back).unwrap(), 16384);
    assert_eq!(back, data);
    // At EOF the read comes back short.
    assert_eq!(vol.read(&mut fh, &mut back).unwrap(), 0);
    vol.close(&mut fh).unwrap();
}

#[test]
fn unaligned_read_write_round_trip() {
    let mut vol = fat16_volume();
    let data: Vec<u8> = (0u32..40_000).map(|i| (i % 251) as u8).collect();

    let mut fh = vol
        .open("/data.bin", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    // Write in awkward chunk sizes to cross sector and cluster edges.
    for chunk in data.chunks(700) {
        vol.write(&mut fh, chunk).unwrap();
    }
    // Read back through the same handle, unflushed.
    vol.lseek(&mut fh, 0).unwrap();
    let mut back = vec![0u8; data.len()];
    let mut got = 0;
    while got < back.len() {
        let n = vol.read(&mut fh, &mut back[got..(got + 513).min(data.len())]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(back, data);
    vol.close(&mut fh).unwrap();
}

#[test]
fn lfn_round_trip() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/Hello, World.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut fh).unwrap();

    let mut dh = vol.opendir("/").unwrap();
    let fi = vol.readdir(&mut dh).unwrap().expect("one entry");
    assert!(vol.readdir(&mut dh).unwrap().is_none());
    vol.closedir(&mut dh).unwrap();

    assert_eq!(fi.name, "Hello, World.txt");
    // The comma becomes '_' in the 8.3 rendition and the lossy name gets
    // a numeric tail.
    assert_eq!(fi.alt_name, "HELLO_~1.TXT");
    assert_eq!(fi.size, 0);
    assert!(!fi.is_dir());

    // Lookup works through either name, case-insensitively.
    vol.stat("/hello, world.TXT").unwrap();
    vol.stat("/HELLO_~1.TXT").unwrap();
}

#[test]
fn numeric_tail_collision_resolution() {
    let mut vol = fat16_volume();
    for i in 0..8 {
        let name = format!("/longer name {i}.txt");
        let mut fh = vol.open(&name, OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        vol.close(&mut fh).unwrap();
    }
    let mut dh = vol.opendir("/").unwrap();
    let mut alts = Vec::new();
    while let Some(fi) = vol.readdir(&mut dh).unwrap() {
        alts.push(fi.alt_name);
    }
    vol.closedir(&mut dh).unwrap();
    assert_eq!(alts.len(), 8);
    alts.sort();
    alts.dedup();
    assert_eq!(alts.len(), 8, "numbered short names must be unique");
}

#[test]
fn short_lowercase_name_uses_nt_flags() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/readme.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut fh).unwrap();

    let fi = vol.stat("/readme.txt").unwrap();
    // Fits 8.3: stored without LFN slots, case recorded in NT flags.
    assert_eq!(fi.name, "readme.txt");
    assert_eq!(fi.alt_name, "README.TXT");
}

#[test]
fn non_ascii_names_round_trip() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/Résumé.doc", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut fh).unwrap();
    // Case folding covers Latin-1.
    let fi = vol.stat("/résumé.doc").unwrap();
    assert_eq!(fi.name, "Résumé.doc");
}

#[test]
fn share_table_rejects_concurrent_access() {
    let mut vol = fat32_volume();
    let mut w = vol.open("/x", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();

    assert_eq!(vol.open("/x", OpenMode::READ).unwrap_err(), FsError::Locked);
    assert_eq!(
        vol.open("/x", OpenMode::READ | OpenMode::WRITE).unwrap_err(),
        FsError::Locked
    );
    assert_eq!(vol.unlink("/x").unwrap_err(), FsError::Locked);

    vol.close(&mut w).unwrap();
    let mut r1 = vol.open("/x", OpenMode::READ).unwrap();
    let mut r2 = vol.open("/x", OpenMode::READ).unwrap();
    // Readers share; a writer is excluded while they are open.
    assert_eq!(
        vol.open("/x", OpenMode::WRITE).unwrap_err(),
        FsError::Locked
    );
    vol.close(&mut r1).unwrap();
    vol.close(&mut r2).unwrap();
    let mut w = vol.open("/x", OpenMode::WRITE).unwrap();
    vol.close(&mut w).unwrap();
}

#[test]
fn stale_handle_is_rejected_after_remount() {
    let mut vol = fat16_volume();
    let mut fh = vol.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, b"hello").unwrap();
    vol.close(&mut fh).unwrap();

    let mut fh = vol.open("/f", OpenMode::READ).unwrap();
    vol.mount().unwrap(); // new mount id
    let mut buf = [0u8; 5];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap_err(), FsError::InvalidObject);
}

#[test]
fn unlink_reclaims_space() {
    let mut vol = fat16_volume();
    let cluster_bytes = 1024u32; // spc = 2
    let chunk = vec![0x5Au8; 1024 * 1024];

    let mut fh = vol.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, &chunk).unwrap();
    vol.close(&mut fh).unwrap();
    let x = vol.getfree().unwrap();

    vol.unlink("/f").unwrap();
    assert_eq!(vol.getfree().unwrap(), x + chunk.len() as u32 / cluster_bytes);
    assert_eq!(vol.stat("/f").unwrap_err(), FsError::NoFile);

    let mut fh = vol.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, &chunk).unwrap();
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.getfree().unwrap(), x);
}

#[test]
fn rename_across_directories() {
    let mut vol = fat32_volume();
    vol.mkdir("/d1").unwrap();
    vol.mkdir("/d2").unwrap();
    let mut fh = vol.open("/d1/a", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();

    let before = vol.stat("/d1/a").unwrap();
    vol.rename("/d1/a", "/d2/b").unwrap();

    assert_eq!(vol.stat("/d1/a").unwrap_err(), FsError::NoFile);
    let after = vol.stat("/d2/b").unwrap();
    assert_eq!(after.size, 0);
    // Same entry byte-offset under the new parent.
    assert_eq!(before.inode & 0xF, after.inode & 0xF);
    assert!(after.inode >= 2);

    // Renaming onto an existing name is refused.
    let mut fh = vol.open("/d1/c", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.rename("/d1/c", "/d2/b").unwrap_err(), FsError::Exists);
}

#[test]
fn rename_directory_repoints_dotdot() {
    let mut vol = fat16_volume();
    vol.mkdir("/outer").unwrap();
    vol.mkdir("/outer/sub").unwrap();
    vol.mkdir("/target").unwrap();
    vol.rename("/outer/sub", "/target/sub").unwrap();

    // ".." of the moved directory now resolves to /target.
    vol.chdir("/target/sub").unwrap();
    vol.chdir("..").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/target");
}

#[test]
fn fat12_packed_fat_entries_survive_chains() {
    let mut vol = fat12_volume();
    assert_eq!(vol.fat_type(), Some(FatType::Fat12));

    // Several multi-cluster files force odd/even FAT12 entries, including
    // ones straddling sector boundaries.
    let payload: Vec<u8> = (0u32..30_000).map(|i| (i % 127) as u8).collect();
    for i in 0..6 {
        let name = format!("/f{i}.bin");
        let mut fh = vol.open(&name, OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        vol.write(&mut fh, &payload).unwrap();
        vol.close(&mut fh).unwrap();
    }
    for i in 0..6 {
        let name = format!("/f{i}.bin");
        let mut fh = vol.open(&name, OpenMode::READ).unwrap();
        let mut back = vec![0u8; payload.len()];
        assert_eq!(vol.read(&mut fh, &mut back).unwrap(), payload.len());
        assert_eq!(back, payload);
        vol.close(&mut fh).unwrap();
    }

    let free_before = vol.getfree().unwrap();
    vol.unlink("/f3.bin").unwrap();
    let clusters = 30_000u32.div_ceil(512);
    assert_eq!(vol.getfree().unwrap(), free_before + clusters);
}

#[test]
fn truncate_frees_tail_clusters() {
    let mut vol = fat16_volume();
    let data = vec![0xEEu8; 100 * 1024];
    let mut fh = vol
        .open("/t", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &data).unwrap();
    vol.close(&mut fh).unwrap();
    let free_full = vol.getfree().unwrap();

    let mut fh = vol.open("/t", OpenMode::READ | OpenMode::WRITE).unwrap();
    vol.lseek(&mut fh, 10 * 1024).unwrap();
    vol.truncate(&mut fh).unwrap();
    assert_eq!(fh.size(), 10 * 1024);
    vol.close(&mut fh).unwrap();

    assert_eq!(vol.stat("/t").unwrap().size, 10 * 1024);
    assert_eq!(vol.getfree().unwrap(), free_full + 90 * 1024 / 1024);

    // Truncating at zero drops the whole chain.
    let mut fh = vol.open("/t", OpenMode::READ | OpenMode::WRITE).unwrap();
    vol.truncate(&mut fh).unwrap();
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.stat("/t").unwrap().size, 0);
}

#[test]
fn append_mode_positions_at_end() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/log.txt", OpenMode::WRITE | OpenMode::OPEN_APPEND)
        .unwrap();
    vol.write(&mut fh, b"first").unwrap();
    vol.close(&mut fh).unwrap();

    let mut fh = vol
        .open("/log.txt", OpenMode::WRITE | OpenMode::OPEN_APPEND)
        .unwrap();
    assert_eq!(fh.tell(), 5);
    vol.write(&mut fh, b" second").unwrap();
    vol.close(&mut fh).unwrap();

    let mut fh = vol.open("/log.txt", OpenMode::READ).unwrap();
    let mut buf = vec![0u8; 12];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 12);
    assert_eq!(&buf, b"first second");
    vol.close(&mut fh).unwrap();
}

#[test]
fn seek_past_end_extends_writable_file() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/sparse", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.lseek(&mut fh, 50 * 1024).unwrap();
    assert_eq!(fh.size(), 50 * 1024);
    vol.write(&mut fh, b"tail").unwrap();
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.stat("/sparse").unwrap().size, 50 * 1024 + 4);

    // A read-only handle clamps instead.
    let mut fh = vol.open("/sparse", OpenMode::READ).unwrap();
    vol.lseek(&mut fh, u64::MAX).unwrap();
    assert_eq!(fh.tell(), 50 * 1024 + 4);
    vol.close(&mut fh).unwrap();
}

#[test]
fn read_after_write_within_handle() {
    let mut vol = fat16_volume();
    let mut fh = vol
        .open("/rw", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut fh, &vec![1u8; 3000]).unwrap();
    vol.lseek(&mut fh, 100).unwrap();
    vol.write(&mut fh, b"XYZ").unwrap();
    vol.lseek(&mut fh, 99).unwrap();
    let mut buf = [0u8; 5];
    vol.read(&mut fh, &mut buf).unwrap();
    assert_eq!(&buf, b"\x01XYZ\x01");
    vol.close(&mut fh).unwrap();
}

#[test]
fn mkdir_chdir_getcwd_and_relative_paths() {
    let mut vol = fat32_volume();
    vol.mkdir("/docs").unwrap();
    vol.mkdir("/docs/work").unwrap();
    assert_eq!(vol.mkdir("/docs").unwrap_err(), FsError::Exists);

    vol.chdir("/docs/work").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/docs/work");

    // Relative create resolves against the current directory.
    let mut fh = vol.open("notes.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();
    vol.stat("/docs/work/notes.txt").unwrap();

    vol.chdir("..").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/docs");
    vol.chdir("/").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/");

    // Missing intermediate vs missing leaf.
    assert_eq!(vol.stat("/nope/x").unwrap_err(), FsError::NoPath);
    assert_eq!(vol.stat("/docs/x").unwrap_err(), FsError::NoFile);
    // A file in an intermediate position is not a path.
    assert_eq!(
        vol.stat("/docs/work/notes.txt/deeper").unwrap_err(),
        FsError::NoPath
    );
}

#[test]
fn rmdir_requires_empty_directory() {
    let mut vol = fat16_volume();
    vol.mkdir("/d").unwrap();
    let mut fh = vol.open("/d/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();

    assert_eq!(vol.rmdir("/d").unwrap_err(), FsError::Denied);
    assert_eq!(vol.unlink("/d").unwrap_err(), FsError::Denied); // not a file
    vol.unlink("/d/f").unwrap();
    vol.rmdir("/d").unwrap();
    assert_eq!(vol.stat("/d").unwrap_err(), FsError::NoFile);
}

#[test]
fn chmod_readonly_blocks_writes_and_delete() {
    let mut vol = fat16_volume();
    let mut fh = vol.open("/locked", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();

    vol.chmod("/locked", 0x01, 0x01).unwrap(); // set AM_RDO
    assert!(vol.stat("/locked").unwrap().is_read_only());
    assert_eq!(
        vol.open("/locked", OpenMode::READ | OpenMode::WRITE).unwrap_err(),
        FsError::Denied
    );
    assert_eq!(vol.unlink("/locked").unwrap_err(), FsError::Denied);

    vol.chmod("/locked", 0x00, 0x01).unwrap();
    vol.unlink("/locked").unwrap();
}

#[test]
fn utimes_sets_modification_stamp() {
    let mut vol = fat16_volume();
    let mut fh = vol.open("/stamp", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();

    // 2004-06-05 10:30:00 in packed FAT form.
    let date = ((2004u16 - 1980) << 9) | (6 << 5) | 5;
    let time = (10u16 << 11) | (30 << 5) | 0;
    vol.utimes("/stamp", date, time).unwrap();
    let fi = vol.stat("/stamp").unwrap();
    assert_eq!(fi.date, date);
    assert_eq!(fi.time, time);
}

#[test]
fn volume_label_round_trip() {
    let mut vol = fat16_volume();
    assert_eq!(vol.getlabel().unwrap(), "");
    vol.setlabel("archive").unwrap();
    assert_eq!(vol.getlabel().unwrap(), "ARCHIVE");

    // The label entry is not a directory entry.
    let mut dh = vol.opendir("/").unwrap();
    assert!(vol.readdir(&mut dh).unwrap().is_none());
    vol.closedir(&mut dh).unwrap();

    vol.setlabel("").unwrap();
    assert_eq!(vol.getlabel().unwrap(), "");
}

#[test]
fn link_map_fast_seek_reads_fragmented_file() {
    let mut vol = fat16_volume();

    // Fragment /a by interleaving with /b.
    let mut a = vol.open("/a", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    let mut b = vol.open("/b", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    for i in 0u8..4 {
        vol.write(&mut a, &vec![i; 4096]).unwrap();
        vol.write(&mut b, &vec![0xFF; 4096]).unwrap();
    }
    vol.close(&mut b).unwrap();

    let runs = vol.create_link_map(&mut a).unwrap();
    assert!(runs >= 2, "interleaved writes should fragment the chain");

    vol.lseek(&mut a, 2 * 4096 + 17).unwrap();
    let mut buf = [0u8; 8];
    vol.read(&mut a, &mut buf).unwrap();
    assert_eq!(buf, [2u8; 8]);

    // A mapped file refuses to grow.
    vol.lseek(&mut a, 4 * 4096).unwrap();
    assert_eq!(vol.write(&mut a, b"zz").unwrap_err(), FsError::Denied);
    vol.close(&mut a).unwrap();
}

#[test]
fn invalid_names_are_rejected() {
    let mut vol = fat16_volume();
    for bad in ["/a*b", "/que?", "/pipe|", "/<y>", "/colon:z", "/quote\"q"] {
        assert_eq!(
            vol.open(bad, OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap_err(),
            FsError::InvalidName,
            "{bad} must be rejected"
        );
    }
    // Trailing dots and spaces are trimmed, not errors.
    let mut fh = vol.open("/name. ", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.close(&mut fh).unwrap();
    vol.stat("/name").unwrap();
}

#[test]
fn write_protected_media_rejects_write_open() {
    init_logging();
    let img = build_fat_image(16384, 2, false);
    let mut dev = MemDevice::from_bytes(img, SS);
    dev.set_write_protected(true);
    let mut vol = FatVolume::new(dev, MountOptions::default()).unwrap();
    assert_eq!(
        vol.open("/x", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap_err(),
        FsError::WriteProtected
    );
    // Reads still work.
    assert_eq!(vol.stat("/x").unwrap_err(), FsError::NoFile);
}

#[test]
fn mounts_volume_inside_mbr_partition() {
    init_logging();
    let inner = build_fat_image(16384, 2, false);
    let disk = wrap_in_mbr(&inner, 2048, 0x06);
    let mut vol = mount_image(disk);
    assert_eq!(vol.fat_type(), Some(FatType::Fat16));

    let mut fh = vol.open("/part.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, b"in a partition").unwrap();
    vol.close(&mut fh).unwrap();
    assert_eq!(vol.stat("/part.txt").unwrap().size, 14);
}

#[test]
fn mounts_volume_inside_gpt_partition() {
    init_logging();
    let inner = build_fat_image(131072, 1, true);
    let disk = wrap_in_gpt(&inner, 2048);
    let mut vol = mount_image(disk);
    assert_eq!(vol.fat_type(), Some(FatType::Fat32));
    vol.mkdir("/gpt-works").unwrap();
    assert!(vol.stat("/gpt-works").unwrap().is_dir());
}

#[test]
fn file_backed_device_persists_across_reopen() {
    init_logging();
    let img = build_fat_image(16384, 2, false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");
    std::fs::write(&path, &img).unwrap();

    let dev = silt_core::FileDevice::open(&path).unwrap();
    let mut vol = FatVolume::new(dev, MountOptions::default()).unwrap();
    let mut fh = vol.open("/persist.bin", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, b"durable").unwrap();
    vol.close(&mut fh).unwrap();
    vol.unmount().unwrap();
    drop(vol);

    let dev = silt_core::FileDevice::open(&path).unwrap();
    let mut vol = FatVolume::new(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.stat("/persist.bin").unwrap().size, 7);
}

#[test]
fn garbage_device_reports_no_filesystem() {
    init_logging();
    let dev = MemDevice::from_bytes(vec![0u8; 1024 * SS], SS);
    let mut vol = FatVolume::new(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.mount().unwrap_err(), FsError::NoFilesystem);
    assert_eq!(vol.fat_type(), None);
}

#[test]
fn fsinfo_hints_survive_sync() {
    let mut vol = fat32_volume();
    let free0 = vol.getfree().unwrap();
    let mut fh = vol.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
    vol.write(&mut fh, &vec![0u8; 4096]).unwrap();
    vol.close(&mut fh).unwrap();
    vol.sync_fs().unwrap();

    // Remount: the hint written to FSInfo is picked up unchanged.
    vol.mount().unwrap();
    assert_eq!(vol.getfree().unwrap(), free0 - 8); // 8 sectors of 512 = 8 clusters
}
