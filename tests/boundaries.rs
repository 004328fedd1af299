//! Boundary behavior around the transfer limit and device capacity.

mod common;

use common::{setup, word_ramp};
use npu_nvme::{EngineConfig, TransferError, TransferItem};

/// A chunk of exactly `max_transfer` bytes moves in one command.
#[test]
fn test_chunk_of_exactly_max_transfer() {
    let (npu, driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default().with_chunk_size(64 * 1024),
    );
    let m = engine.max_transfer();
    assert_eq!(m, 64 * 1024);

    let ptr = npu.alloc(m);
    npu.write(ptr, &word_ramp(m, 9));
    let report = engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: 0,
            len: m,
        }])
        .expect("write");
    assert_eq!(report.chunks, 1);
    assert_eq!(driver.submissions().len(), 1);
    assert_eq!(driver.read_media(0, m), word_ramp(m, 9));
}

/// An item one byte over the limit is sliced into two chunks rather
/// than rejected.
#[test]
fn test_item_one_byte_over_max_transfer_is_sliced() {
    let (npu, driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default().with_chunk_size(64 * 1024),
    );
    let m = engine.max_transfer();

    let len = m + 1;
    let ptr = npu.alloc(len);
    npu.write(ptr, &word_ramp(len, 77));
    let report = engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: 0,
            len,
        }])
        .expect("write");
    assert_eq!(report.chunks, 2);
    assert_eq!(report.bytes, len as u64);

    let submissions = driver.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].nblocks as usize * 512, m);
    assert_eq!(submissions[1].nblocks, 1);

    let back = npu.alloc(len);
    engine
        .read_batch(&[TransferItem {
            device_ptr: back,
            storage_offset: 0,
            len,
        }])
        .expect("read");
    assert_eq!(npu.read(back, len), word_ramp(len, 77));
}

/// The final block of the namespace is addressable; one block further
/// is not.
#[test]
fn test_final_block_addressing() {
    let total_sectors = 4096u64;
    let (npu, _driver, mut engine) =
        setup(512, total_sectors, EngineConfig::default().with_chunk_size(4096));
    let capacity = total_sectors * 512;

    let ptr = npu.alloc(512);
    npu.fill(ptr, 0x5e, 512);

    // Last block: fits.
    engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: capacity - 512,
            len: 512,
        }])
        .expect("write to final block");

    // One block past the end: capacity error.
    let result = engine.write_batch(&[TransferItem {
        device_ptr: ptr,
        storage_offset: capacity,
        len: 512,
    }]);
    assert_eq!(result.unwrap_err(), TransferError::Capacity);
}

/// A sub-sector tail still round-trips; the device command covers the
/// padded sector but only the payload bytes come back to the caller.
#[test]
fn test_sub_sector_tail() {
    let (npu, _driver, mut engine) = setup(512, 1 << 12, EngineConfig::default());
    let len = 1000;
    let ptr = npu.alloc(len);
    npu.write(ptr, &word_ramp(len, 31));

    engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: 0,
            len,
        }])
        .expect("write");

    let back = npu.alloc(len);
    engine
        .read_batch(&[TransferItem {
            device_ptr: back,
            storage_offset: 0,
            len,
        }])
        .expect("read");
    assert_eq!(npu.read(back, len), word_ramp(len, 31));
}

/// An empty batch is a successful no-op in both directions.
#[test]
fn test_empty_batch_no_op() {
    let (_npu, driver, mut engine) = setup(512, 1 << 12, EngineConfig::default());
    let write = engine.write_batch(&[]).expect("empty write");
    let read = engine.read_batch(&[]).expect("empty read");
    assert_eq!(write.chunks, 0);
    assert_eq!(read.chunks, 0);
    assert!(driver.submissions().is_empty());
}
