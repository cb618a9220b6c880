//! Simulated disk device.
//!
//! The disk is an array of [`NUM_SECTORS`] sectors of [`SECTOR_SIZE`] bytes,
//! persisted in a host file so that a formatted filesystem survives across
//! runs. Requests copy their data immediately but *complete* only when the
//! interrupt scheduled [`DISK_DELAY`](crate::DISK_DELAY) ticks later fires —
//! the same request/completion split real disks have, which is what forces
//! the layer above to sleep on a semaphore (see the kernel's synchronous
//! disk).
//!
//! The device supports one outstanding request. Issuing a second before the
//! first completes is a driver bug and asserts.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{interrupt, stats, trace, DISK_DELAY, NUM_SECTORS, SECTOR_SIZE};

struct Disk {
    image: File,
    active: bool,
    handler: Option<fn()>,
}

static mut DISK: Option<Disk> = None;

fn disk() -> &'static mut Disk {
    unsafe { DISK.as_mut().expect("no disk attached") }
}

/// Attach a disk image at `path`, creating and zero-filling it if it does
/// not exist or is the wrong size.
pub fn attach(path: &Path) -> std::io::Result<()> {
    let mut image = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let want = (NUM_SECTORS * SECTOR_SIZE) as u64;
    if image.metadata()?.len() != want {
        image.set_len(want)?;
    }
    unsafe {
        DISK = Some(Disk {
            image,
            active: false,
            handler: None,
        });
    }
    Ok(())
}

/// Register the completion interrupt handler. One per boot.
pub fn set_handler(handler: fn()) {
    disk().handler = Some(handler);
}

fn begin_request(sector: usize) {
    let d = disk();
    assert!(sector < NUM_SECTORS, "sector {sector} out of range");
    assert!(!d.active, "disk request issued while one is outstanding");
    d.active = true;
}

fn schedule_completion() {
    interrupt::schedule(
        DISK_DELAY,
        Box::new(|| {
            let d = disk();
            d.active = false;
            if let Some(handler) = d.handler {
                handler();
            }
        }),
    );
}

/// Read one sector. `buf` is filled immediately; the request is complete
/// when the interrupt fires.
pub fn read_request(sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
    begin_request(sector);
    trace!('d', "disk read sector {}", sector);
    let d = disk();
    d.image
        .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
        .and_then(|_| d.image.read_exact(buf))
        .expect("disk image read failed");
    stats::add_disk_read(1);
    schedule_completion();
}

/// Write one sector. The image is updated immediately; the request is
/// complete when the interrupt fires.
pub fn write_request(sector: usize, buf: &[u8; SECTOR_SIZE]) {
    begin_request(sector);
    trace!('d', "disk write sector {}", sector);
    let d = disk();
    d.image
        .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
        .and_then(|_| d.image.write_all(buf))
        .and_then(|_| d.image.flush())
        .expect("disk image write failed");
    stats::add_disk_write(1);
    schedule_completion();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::IntStatus;

    #[test]
    fn sector_round_trip() {
        let _m = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::power_on();
        let dir = tempfile::tempdir().unwrap();
        attach(&dir.path().join("DISK.img")).unwrap();
        interrupt::set_level(IntStatus::On);

        let mut sector = [0u8; SECTOR_SIZE];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = i as u8;
        }
        write_request(3, &sector);
        // Let the completion fire so the next request is legal.
        interrupt::set_level(IntStatus::Off);
        interrupt::idle();
        interrupt::set_level(IntStatus::On);

        let mut back = [0u8; SECTOR_SIZE];
        read_request(3, &mut back);
        assert_eq!(sector, back);
    }
}
