//! Register I/O (spec.md §4.1): a software cache mirroring each of the
//! three memory-mapped banks, with the serial-register stall/bus-flush
//! discipline layered on top of raw `Hardware` reads and writes.

pub mod clockgen;

use std::sync::Arc;

use crate::error::{AdqError, Result};
use crate::hw::{Hardware, RegisterBank};
use crate::sync::ShortLock;

/// Number of addressable 32-bit words in the Device bank (indices 0..=0x14).
pub const DEVICE_BANK_WORDS: usize = 0x15;
/// Number of addressable 32-bit words in the DMA bank.
pub const DMA_BANK_WORDS: usize = 8;
/// Number of addressable 32-bit words in the Config bank.
pub const CONFIG_BANK_WORDS: usize = 16;

/// Device-bank status word index (spec.md §6): TS-FIFO-empty,
/// TS-FIFO-overflow, and PCI-FIFO-full bits live here.
pub const DEV_STATUS_INDEX: usize = 0x0D;
/// Device-bank timestamp register pair, read as {high, low}.
pub const DEV_TS_HIGH_INDEX: usize = 0x0E;
pub const DEV_TS_LOW_INDEX: usize = 0x0F;

pub const STATUS_TS_FIFO_EMPTY: u32 = 1 << 0;
pub const STATUS_TS_FIFO_MORE_AVAILABLE: u32 = 1 << 1;
pub const STATUS_TS_FIFO_OVERFLOW: u32 = 1 << 2;
pub const STATUS_PCI_FIFO_FULL: u32 = 1 << 3;
/// Clock-generator DCM reset pulse and lock bits, also in the device-bank
/// status word (spec.md §4.4).
pub const STATUS_DCM_RESET: u32 = 1 << 4;
pub const STATUS_DCM_LOCK: u32 = 1 << 5;

/// DMA-bank composite interrupt-status word (spec.md §4.5).
pub const DMA_STATUS_INDEX: usize = 0;
pub const DMA_STATUS_DMA_COMPLETE: u32 = 0x0100_0100;
pub const DMA_STATUS_SAMPLES_COMPLETE: u32 = 0x0000_0200;
/// The two independent interrupt-clear registers (newer firmware only).
pub const DMA_CLEAR_INTERRUPT_INDEX: usize = 1;
pub const DMA_CLEAR_SAMP_COMP_INTERRUPT_INDEX: usize = 2;
/// Transfer-length/address registers programmed before a fast DMA start.
pub const DMA_TLP_SIZE_INDEX: usize = 3;
pub const DMA_TLP_COUNT_INDEX: usize = 4;
pub const DMA_START_ADDR_LOW_INDEX: usize = 5;
pub const DMA_START_ADDR_HIGH_INDEX: usize = 6;
/// DMA initiator control: reset bit and the (direction-inverted, per the
/// device's own point of view) start-transfer bits (spec.md §4.6).
pub const DMA_CONTROL_INDEX: usize = 7;
pub const DMA_CONTROL_RESET_BIT: u32 = 1 << 31;
pub const DMA_CONTROL_START_DEV_TO_HOST: u32 = 0x0001_0000;
pub const DMA_CONTROL_START_HOST_TO_DEV: u32 = 0x0000_0001;

/// Device-bank operating-mode register (spec.md §4.4).
pub const DEV_MODE_INDEX: usize = 0x00;

/// Device-bank serial-register indices (spec.md §4.1): writes stall and
/// are followed by a bus-flush read; reads are two-phase.
pub const DEVICE_SERIAL_INDICES: [usize; 4] = [0x08, 0x09, 0x0A, 0x0B];
/// Device-bank clock-generator serial-word register, used by `clockgen`.
pub const DEV_CG_SERIAL_INDEX: usize = 0x08;

const SERIAL_WRITE_STALL_MICROS: u64 = 5;
const SERIAL_READ_STALL_MICROS: u64 = 4;

/// Whether a read should prefer the cache or force a fresh hardware read
/// (spec.md §4.1). Status registers ignore this and always read hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    FromCache,
    FromHardware,
}

fn bank_len(bank: RegisterBank) -> usize {
    match bank {
        RegisterBank::Device => DEVICE_BANK_WORDS,
        RegisterBank::Dma => DMA_BANK_WORDS,
        RegisterBank::Config => CONFIG_BANK_WORDS,
    }
}

fn is_serial(bank: RegisterBank, index: usize) -> bool {
    bank == RegisterBank::Device && DEVICE_SERIAL_INDICES.contains(&index)
}

fn is_status(bank: RegisterBank, index: usize) -> bool {
    (bank == RegisterBank::Device && index == DEV_STATUS_INDEX)
        || (bank == RegisterBank::Dma && index == DMA_STATUS_INDEX)
}

/// The cached, partially-bit-addressable register model shared by every
/// higher-level module (spec.md Data Model: RegisterBankCache).
pub struct RegisterBankCache {
    hw: Arc<dyn Hardware>,
    device: ShortLock<Vec<u32>>,
    dma: ShortLock<Vec<u32>>,
    config: ShortLock<Vec<u32>>,
}

impl RegisterBankCache {
    pub fn new(hw: Arc<dyn Hardware>) -> Self {
        RegisterBankCache {
            hw,
            device: ShortLock::new(vec![0; DEVICE_BANK_WORDS]),
            dma: ShortLock::new(vec![0; DMA_BANK_WORDS]),
            config: ShortLock::new(vec![0; CONFIG_BANK_WORDS]),
        }
    }

    fn cache_for(&self, bank: RegisterBank) -> &ShortLock<Vec<u32>> {
        match bank {
            RegisterBank::Device => &self.device,
            RegisterBank::Dma => &self.dma,
            RegisterBank::Config => &self.config,
        }
    }

    /// A read of a known non-destructive status register, used whenever a
    /// side effect must be visible before the next access (spec.md §4.1).
    pub fn bus_flush(&self) -> Result<()> {
        self.hw.read_register(RegisterBank::Device, DEV_STATUS_INDEX)?;
        Ok(())
    }

    /// Read-modify-write the cache under the short lock, then issue the
    /// hardware write. Serial registers stall ~5µs and bus-flush before the
    /// lock is released, so a following serial write can't overtake this one.
    pub fn write(&self, bank: RegisterBank, index: usize, value: u32, mask: u32) -> Result<()> {
        if index >= bank_len(bank) {
            return Err(AdqError::InvalidArg("register index out of range"));
        }
        let cache = self.cache_for(bank);
        let mut words = cache.lock();
        let merged = (words[index] & !mask) | (value & mask);
        words[index] = merged;
        self.hw.write_register(bank, index, merged)?;
        if is_serial(bank, index) {
            self.hw
                .read_register(RegisterBank::Device, DEV_STATUS_INDEX)?;
            self.hw.stall_micros(SERIAL_WRITE_STALL_MICROS);
        }
        Ok(())
    }

    pub fn write_full(&self, bank: RegisterBank, index: usize, value: u32) -> Result<()> {
        self.write(bank, index, value, u32::MAX)
    }

    /// Status registers always read hardware; serial registers require a
    /// two-phase access (post request, stall, read valid word).
    pub fn read(&self, bank: RegisterBank, index: usize, policy: ReadPolicy) -> Result<u32> {
        if index >= bank_len(bank) {
            return Err(AdqError::InvalidArg("register index out of range"));
        }
        if is_status(bank, index) {
            let value = self.hw.read_register(bank, index)?;
            self.cache_for(bank).lock()[index] = value;
            return Ok(value);
        }
        if is_serial(bank, index) {
            // First phase posts the request; the valid word only appears
            // after the settling stall.
            let _ = self.hw.read_register(bank, index)?;
            self.hw.stall_micros(SERIAL_READ_STALL_MICROS);
            let value = self.hw.read_register(bank, index)?;
            self.cache_for(bank).lock()[index] = value;
            return Ok(value);
        }
        match policy {
            ReadPolicy::FromCache => Ok(self.cache_for(bank).lock()[index]),
            ReadPolicy::FromHardware => {
                let value = self.hw.read_register(bank, index)?;
                self.cache_for(bank).lock()[index] = value;
                Ok(value)
            }
        }
    }

    /// Device-bank timestamp register pair, read as {high, low} (spec.md §6).
    pub fn read_timestamp(&self) -> Result<u64> {
        let high = self.read(RegisterBank::Device, DEV_TS_HIGH_INDEX, ReadPolicy::FromHardware)?;
        let low = self.read(RegisterBank::Device, DEV_TS_LOW_INDEX, ReadPolicy::FromHardware)?;
        Ok(((high as u64) << 32) | low as u64)
    }
}
