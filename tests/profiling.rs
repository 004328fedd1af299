//! Profiling CSV emission. Kept in its own test binary because it
//! changes the process working directory.

mod common;

use common::{setup, word_ramp};
use npu_nvme::{EngineConfig, TransferItem};

#[test]
fn test_profiling_csv_written_per_direction() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let (npu, _driver, mut engine) = setup(
        512,
        1 << 16,
        EngineConfig::default()
            .with_chunk_size(4096)
            .with_profiling(true),
    );

    let len = 4 * 4096;
    let ptr = npu.alloc(len);
    npu.write(ptr, &word_ramp(len, 1));
    let items = [TransferItem {
        device_ptr: ptr,
        storage_offset: 0,
        len,
    }];
    engine.write_batch(&items).expect("write");
    engine.read_batch(&items).expect("read");

    for name in ["time_write.csv", "time_read.csv"] {
        let text = std::fs::read_to_string(dir.path().join(name))
            .unwrap_or_else(|_| panic!("{} missing", name));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "item,buffer,copy_us,storage_us");
        assert_eq!(lines.len(), 1 + 4, "{} should have one row per chunk", name);
        for row in &lines[1..] {
            let fields: Vec<&str> = row.split(',').collect();
            assert_eq!(fields.len(), 4);
            assert_eq!(fields[0], "0");
            fields[1].parse::<usize>().unwrap();
            fields[2].parse::<u64>().unwrap();
            fields[3].parse::<u64>().unwrap();
        }
    }
}
