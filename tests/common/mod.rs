//! Shared helpers for the integration tests.

use npu_nvme::testing::{MockNpu, MockNvme};
use npu_nvme::{EngineConfig, PciAddress, TransferEngine};

/// Device memory given to every mock accelerator
pub const ARENA_LEN: usize = 64 * 1024 * 1024;

pub fn pci_address() -> PciAddress {
    "0000:83:00.0".parse().unwrap()
}

/// Build an engine over fresh mocks
pub fn setup(
    sector_size: u32,
    total_sectors: u64,
    config: EngineConfig,
) -> (MockNpu, MockNvme, TransferEngine) {
    let npu = MockNpu::new(ARENA_LEN);
    let driver = MockNvme::new(sector_size, total_sectors);
    let engine = TransferEngine::init(
        Box::new(npu.clone()),
        &driver,
        &pci_address(),
        0,
        config,
    )
    .expect("engine init");
    (npu, driver, engine)
}

/// Little-endian `u32` ramp starting at `start`, as raw bytes
pub fn word_ramp(len: usize, start: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut word = start;
    while data.len() < len {
        data.extend_from_slice(&word.to_le_bytes());
        word = word.wrapping_add(1);
    }
    data.truncate(len);
    data
}
