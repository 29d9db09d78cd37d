//! The transport boundary between control logic and the physical board
//! (SPEC_FULL.md §10.5).
//!
//! Everything above this module (`regs`, `dma`, `device`, `recording`) is
//! written against the `Hardware` trait, not against any one transport. A
//! production binary implements it over a real `/dev/adqN` character
//! device (ioctl for register access, `mmap` for DMA buffers); this crate
//! ships `SimHardware`, an in-process model, so the control logic can be
//! exercised without real silicon — the same role `other_examples`'s
//! `openvmm::EmulatedDevice` plays for its PCI device drivers.

mod sim;

pub use sim::SimHardware;

use std::sync::Arc;

use crate::config::FirmwareVersions;
use crate::error::Result;

/// The three memory-mapped register address spaces (spec.md §4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    /// Main control/status bank, indices 0–0x14.
    Device,
    /// DMA initiator control: start/length/address plus the two
    /// interrupt-clear registers.
    Dma,
    /// EEPROM/JTAG/FPGA-version bank.
    Config,
}

/// Direction of a DMA transfer, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    DeviceToHost,
    HostToDevice,
}

/// A coherent, page-aligned, physically-contiguous host memory region
/// shared with the device (spec.md §3 DmaBuffer, §4.3). Cloning shares the
/// same backing storage — it exists so a caller can hand the region to
/// `Hardware::kick_dma` without holding the buffer table's lock for the
/// duration of the transfer.
#[derive(Clone)]
pub struct CoherentRegion {
    pub kernel_addr: usize,
    pub bus_addr: u64,
    pub len: usize,
    storage: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl CoherentRegion {
    /// Copy `len` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let storage = self.storage.lock();
        out.copy_from_slice(&storage[offset..offset + out.len()]);
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut storage = self.storage.lock();
        storage[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Invoked by the transport whenever the device raises an interrupt; the
/// device's own `interrupt` module (spec.md §4.5) is installed here and
/// does the actual status-register triage.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// The operations a device driver needs from its transport. Register
/// access, coherent-memory management, and interrupt delivery are the only
/// things that differ between "userspace daemon over ioctl/mmap" and
/// "kernel-resident driver" (spec.md §1 Non-goals); everything else in this
/// crate is transport-agnostic.
pub trait Hardware: Send + Sync {
    /// Raw, uncached 32-bit register read. Bit-field decoding and the
    /// cache policy of spec.md §4.1 live in `regs`, not here.
    fn read_register(&self, bank: RegisterBank, index: usize) -> Result<u32>;

    /// Raw 32-bit register write.
    fn write_register(&self, bank: RegisterBank, index: usize, value: u32) -> Result<()>;

    /// Busy-wait for approximately `micros` microseconds. Used for the bus
    /// settling stalls of spec.md §4.1/§4.2 (~4–5 µs) and the DCM lock
    /// poll of §4.4 (~20 µs / ~25 ms spacings).
    fn stall_micros(&self, micros: u64);

    /// Allocate a coherent DMA region of at least `bytes`, already rounded
    /// up to the page size by the caller (spec.md §4.3).
    fn alloc_coherent(&self, bytes: usize) -> Result<CoherentRegion>;

    /// Release a coherent region. May sleep; never called while the
    /// device's short lock is held (spec.md §4.3).
    fn free_coherent(&self, region: CoherentRegion);

    /// Register the callback the transport invokes on every interrupt.
    /// Only one handler is installed, at device-open time.
    fn install_interrupt_handler(&self, handler: InterruptHandler);

    /// Begin a DMA transfer of `bytes` between `region` (at `region_offset`)
    /// and the device, in `direction`. Real hardware does this by the
    /// register programming sequence of spec.md §4.6; `SimHardware` models
    /// the same sequence by inspecting what was last written to the DMA
    /// bank and fabricating the transfer asynchronously, then raising the
    /// interrupt. The control layer always goes through `write_register`
    /// to arm a transfer — this method exists purely so the simulated
    /// transport has a single place to do the simulated data movement
    /// instead of intercepting arbitrary register writes.
    fn kick_dma(
        &self,
        region: &CoherentRegion,
        region_offset: usize,
        bytes: usize,
        direction: DmaDirection,
    );

    /// Read the system/SAB/PCI/package firmware versions, cached by
    /// `Device::open` (spec.md §6, SPEC_FULL.md §11). On real hardware this
    /// is an EEPROM/config-bank read; `SimHardware` returns a fixed
    /// in-memory value a test can override.
    fn read_firmware_versions(&self) -> Result<FirmwareVersions>;
}

pub(crate) fn new_storage(bytes: usize) -> Arc<parking_lot::Mutex<Vec<u8>>> {
    Arc::new(parking_lot::Mutex::new(vec![0u8; bytes]))
}
