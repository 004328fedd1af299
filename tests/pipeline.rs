//! Pipeline depth behavior: serial degradation at depth 1, full slot
//! occupancy at depth 16, and overlap under a deep pipeline.

mod common;

use common::{setup, word_ramp};
use npu_nvme::{CopyMode, EngineConfig, TransferItem};

/// Depth 1 degrades to serial transfers and still round-trips. Sixty
/// four chunks pass through the single staging buffer one at a time.
#[test]
fn test_depth_one_serial_roundtrip() {
    let (npu, driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default()
            .with_chunk_size(64 * 1024)
            .with_depth(1),
    );
    let m = engine.max_transfer();
    let total = 64 * m;
    let ptr = npu.alloc(total);
    npu.write(ptr, &word_ramp(total, 1));

    let items = [TransferItem {
        device_ptr: ptr,
        storage_offset: 0,
        len: total,
    }];
    let report = engine.write_batch(&items).expect("write");
    assert_eq!(report.chunks, 64);
    // One staging buffer means never more than one command in flight.
    assert_eq!(driver.inflight_peak(), 1);

    let back = npu.alloc(total);
    engine
        .read_batch(&[TransferItem {
            device_ptr: back,
            storage_offset: 0,
            len: total,
        }])
        .expect("read");
    assert_eq!(npu.read(back, total), word_ramp(total, 1));
    assert_eq!(engine.free_slots(), 1);
}

/// Depth 16 occupies every slot before the first completion is drained.
#[test]
fn test_depth_sixteen_full_occupancy() {
    let (npu, driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default()
            .with_chunk_size(4096)
            .with_depth(16)
            .with_copy_mode(CopyMode::Sync),
    );
    driver.set_completion_latency(4);

    let m = engine.max_transfer();
    let total = 16 * m;
    let ptr = npu.alloc(total);
    npu.fill(ptr, 0x44, total);

    engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: 0,
            len: total,
        }])
        .expect("write");

    assert_eq!(driver.inflight_peak(), 16);
    assert_eq!(engine.free_slots(), 16);
}

/// A deep pipeline overlaps storage commands where depth 1 cannot; the
/// in-flight high-water mark is the observable stand-in for the
/// throughput gain.
#[test]
fn test_deep_pipeline_overlaps_where_serial_cannot() {
    let run = |depth: usize| {
        let (npu, driver, mut engine) = setup(
            512,
            1 << 16,
            EngineConfig::default()
                .with_chunk_size(8192)
                .with_depth(depth),
        );
        driver.set_completion_latency(2);
        npu.set_event_latency(1);

        let mut items = Vec::new();
        for index in 0..64u64 {
            let len = 8192;
            let ptr = npu.alloc(len);
            npu.fill(ptr, index as u8, len);
            items.push(TransferItem {
                device_ptr: ptr,
                storage_offset: index * len as u64,
                len,
            });
        }
        engine.write_batch(&items).expect("write");
        driver.inflight_peak()
    };

    let serial_peak = run(1);
    let deep_peak = run(8);
    assert_eq!(serial_peak, 1);
    assert!(
        deep_peak > serial_peak,
        "deep pipeline should overlap commands (peak {} vs {})",
        deep_peak,
        serial_peak
    );
    assert_eq!(deep_peak, 8);
}

/// Chunks of a single item always reach the device in ascending offset
/// order, even when per-slot copies finish out of order.
#[test]
fn test_intra_item_order_with_async_copies() {
    let (npu, driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default()
            .with_chunk_size(4096)
            .with_depth(8)
            .with_copy_mode(CopyMode::Async),
    );
    npu.set_event_latency(2);
    driver.set_completion_latency(1);

    let total = 32 * 4096;
    let ptr = npu.alloc(total);
    npu.write(ptr, &word_ramp(total, 5));
    engine
        .write_batch(&[TransferItem {
            device_ptr: ptr,
            storage_offset: 0,
            len: total,
        }])
        .expect("write");

    let lbas: Vec<u64> = driver.submissions().iter().map(|s| s.lba).collect();
    let mut sorted = lbas.clone();
    sorted.sort_unstable();
    assert_eq!(lbas, sorted);
}
