//! Filesystem tests, each on a freshly formatted disk.

use mirage::SECTOR_SIZE;
use rios::fs::file_header::FileHeader;
use rios::fs::{DIRECTORY_SECTOR, FREE_MAP_SECTOR, NUM_DIRECT, NUM_DIR_ENTRIES};
use rios::system::{boot, file_system, BootOptions};
use rios::KernelError;

fn fs_test(f: impl FnOnce()) {
    boot(BootOptions::default(), f);
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn format_produces_a_clean_image() {
    fs_test(|| {
        assert!(file_system().check());
        // Both well-known headers are where boot-up expects them.
        let map_header = FileHeader::fetch_from(FREE_MAP_SECTOR);
        assert_eq!(map_header.file_length(), mirage::NUM_SECTORS / 8);
        let dir_header = FileHeader::fetch_from(DIRECTORY_SECTOR);
        assert!(dir_header.file_length() > 0);
    });
}

#[test]
fn create_write_read_back_remove() {
    fs_test(|| {
        let fs = file_system();
        fs.create("a", 0, false).unwrap();

        let file = fs.open("a").unwrap();
        assert_eq!(file.write(b"hello").unwrap(), 5);
        fs.close_handle(&file);

        let file = fs.open("a").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        fs.close_handle(&file);

        fs.remove("a").unwrap();
        assert!(fs.check());
    });
}

#[test]
fn create_duplicate_fails() {
    fs_test(|| {
        let fs = file_system();
        fs.create("twice", 0, false).unwrap();
        assert_eq!(fs.create("twice", 0, false), Err(KernelError::FileExist));
    });
}

#[test]
fn open_of_a_missing_file_fails() {
    fs_test(|| {
        assert_eq!(
            file_system().open("missing").err(),
            Some(KernelError::NoSuchEntry)
        );
    });
}

#[test]
fn one_write_grows_past_the_direct_sectors() {
    fs_test(|| {
        let fs = file_system();
        fs.create("big", 0, false).unwrap();
        let file = fs.open("big").unwrap();

        let data = pattern(SECTOR_SIZE * (NUM_DIRECT + 1));
        assert_eq!(file.write(&data).unwrap(), data.len());

        // Byte-by-byte read-back sees exactly what was written.
        for (offset, expected) in data.iter().enumerate() {
            let mut byte = [0u8; 1];
            assert_eq!(file.read_at(&mut byte, offset), 1);
            assert_eq!(byte[0], *expected, "mismatch at offset {offset}");
        }

        // The file spilled into single indirection and no further.
        let header = FileHeader::fetch_from(file.sector());
        assert_ne!(header.raw().single_indirection, -1);
        assert_eq!(header.raw().double_indirection, -1);

        fs.close_handle(&file);
        assert!(fs.check());
    });
}

#[test]
fn extend_within_sector_slack_takes_no_sector() {
    fs_test(|| {
        let fs = file_system();
        fs.create("slack", 10, false).unwrap();
        let free_before = fs.count_free_sectors();
        let file = fs.open("slack").unwrap();
        // Still inside the first sector.
        file.write_at(&pattern(30), 10).unwrap();
        assert_eq!(fs.count_free_sectors(), free_before);
        assert_eq!(file.length(), 40);
        fs.close_handle(&file);
    });
}

#[test]
fn directory_grows_when_its_table_fills() {
    fs_test(|| {
        let fs = file_system();
        for i in 0..NUM_DIR_ENTRIES {
            fs.create(&format!("f{i}"), 0, false).unwrap();
        }
        // The initial table is full; the next create grows it.
        fs.create("over", 0, false).unwrap();
        let file = fs.open("over").unwrap();
        fs.close_handle(&file);
        assert!(fs.check());
    });
}

#[test]
fn hierarchy_create_descend_and_tear_down() {
    fs_test(|| {
        let fs = file_system();
        fs.mkdir("/x").unwrap();
        fs.chdir("/x").unwrap();
        fs.mkdir("y").unwrap();
        fs.chdir("y").unwrap();
        fs.create("f", 0, false).unwrap();

        // Relative resolution from /x/y.
        let file = fs.open("f").unwrap();
        fs.close_handle(&file);

        fs.chdir("../..").unwrap();
        fs.remove("/x/y/f").unwrap();
        fs.remove("/x/y").unwrap();
        fs.remove("/x").unwrap();
        assert!(fs.check());
        assert_eq!(fs.open("/x/y/f").err(), Some(KernelError::NoSuchEntry));
    });
}

#[test]
fn removing_a_nonempty_directory_fails() {
    fs_test(|| {
        let fs = file_system();
        fs.mkdir("d").unwrap();
        fs.create("d/inner", 0, false).unwrap();
        assert_eq!(fs.remove("d"), Err(KernelError::DirectoryNotEmpty));
        fs.remove("d/inner").unwrap();
        fs.remove("d").unwrap();
        assert!(fs.check());
    });
}

#[test]
fn remove_while_open_defers_deletion_to_the_last_close() {
    fs_test(|| {
        let fs = file_system();
        let free_at_start = fs.count_free_sectors();

        fs.create("g", 0, false).unwrap();
        let file = fs.open("g").unwrap();
        file.write(&pattern(3 * SECTOR_SIZE)).unwrap();

        // Removal succeeds immediately but the file lives on.
        fs.remove("g").unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(file.read_at(&mut buf, 0), SECTOR_SIZE);
        assert_eq!(buf[..], pattern(3 * SECTOR_SIZE)[..SECTOR_SIZE]);

        // No new open can reach the tombstoned file.
        assert_eq!(fs.open("g").err(), Some(KernelError::Tombstoned));

        // The last close reclaims every sector.
        fs.close_handle(&file);
        assert_eq!(fs.count_free_sectors(), free_at_start);
        assert_eq!(fs.open("g").err(), Some(KernelError::NoSuchEntry));
        assert!(fs.check());
    });
}

#[test]
fn two_handles_share_one_record() {
    fs_test(|| {
        let fs = file_system();
        fs.create("shared", 0, false).unwrap();
        let a = fs.open("shared").unwrap();
        let b = fs.open("shared").unwrap();
        a.write(b"first").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(b.read_at(&mut buf, 0), 5);
        assert_eq!(&buf, b"first");

        // Removing with both open defers; closing one is not enough.
        fs.remove("shared").unwrap();
        fs.close_handle(&a);
        assert_eq!(b.read_at(&mut buf, 0), 5);
        fs.close_handle(&b);
        assert_eq!(fs.open("shared").err(), Some(KernelError::NoSuchEntry));
        assert!(fs.check());
    });
}

#[test]
fn filling_the_disk_fails_cleanly_and_frees_fully() {
    fs_test(|| {
        let fs = file_system();
        let free_at_start = fs.count_free_sectors();

        // Grow one file until the disk runs out.
        fs.create("hog", 0, false).unwrap();
        let file = fs.open("hog").unwrap();
        let chunk = pattern(64 * SECTOR_SIZE);
        let mut total = 0;
        loop {
            match file.write_at(&chunk, total) {
                Ok(n) => total += n,
                Err(KernelError::NoSpace) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
            assert!(total <= mirage::NUM_SECTORS * SECTOR_SIZE, "never ran out");
        }

        // The failed extension changed nothing.
        let after_failure = fs.count_free_sectors();
        assert_eq!(
            file.write_at(&chunk, total).err(),
            Some(KernelError::NoSpace)
        );
        assert_eq!(fs.count_free_sectors(), after_failure);
        assert_eq!(file.length(), total);
        assert!(fs.check());

        // Everything comes back when the hog goes away.
        fs.close_handle(&file);
        fs.remove("hog").unwrap();
        assert_eq!(fs.count_free_sectors(), free_at_start);
        assert!(fs.check());
    });
}

#[test]
fn the_disk_image_persists_across_boots() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("DISK.img");

    boot(
        BootOptions {
            format: true,
            disk_path: Some(image.clone()),
            ..Default::default()
        },
        || {
            let fs = file_system();
            fs.create("keep", 0, false).unwrap();
            let file = fs.open("keep").unwrap();
            file.write(b"durable").unwrap();
            fs.close_handle(&file);
        },
    );

    boot(
        BootOptions {
            format: false,
            disk_path: Some(image),
            ..Default::default()
        },
        || {
            let fs = file_system();
            let file = fs.open("keep").unwrap();
            let mut buf = [0u8; 7];
            assert_eq!(file.read(&mut buf), 7);
            assert_eq!(&buf, b"durable");
            fs.close_handle(&file);
            assert!(fs.check());
        },
    );
}
