//! Interrupt triage and bottom half (spec.md §4.5).
//!
//! The transport calls `Device::on_interrupt` from whatever context it
//! raises interrupts in. Everything it touches — the short lock and the
//! completion event — is non-sleeping, so the whole dispatch can run
//! inline instead of needing a separate deferred-work context.

use std::sync::atomic::Ordering;

use crate::hw::RegisterBank;
use crate::regs::{
    DMA_CLEAR_INTERRUPT_INDEX, DMA_CLEAR_SAMP_COMP_INTERRUPT_INDEX, DMA_STATUS_DMA_COMPLETE,
    DMA_STATUS_INDEX, DMA_STATUS_SAMPLES_COMPLETE,
};

use super::{Device, DeviceState};

impl Device {
    pub(crate) fn on_interrupt(&self) {
        let status = match self.regs.read(
            RegisterBank::Dma,
            DMA_STATUS_INDEX,
            crate::regs::ReadPolicy::FromHardware,
        ) {
            Ok(v) => v,
            Err(_) => return,
        };
        let dma_complete = status & DMA_STATUS_DMA_COMPLETE != 0;
        let samples_complete = status & DMA_STATUS_SAMPLES_COMPLETE != 0;
        if !dma_complete && !samples_complete {
            return; // not ours
        }

        let mut run_bottom_half = false;
        {
            let mut inner = self.inner.lock();
            if dma_complete {
                inner.stats.dma_complete_count += 1;
                inner.dma_owner = None;
                run_bottom_half = true;
            }
            if samples_complete {
                if inner.mode.is_acquisition() {
                    inner.stats.samples_complete_count += 1;
                }
                // Sticky flag set before scheduling the bottom half, so a
                // client that arms and immediately waits cannot miss it
                // (spec.md §4.5 ordering guarantee).
                if matches!(inner.state, DeviceState::Acq | DeviceState::WRam) {
                    run_bottom_half = true;
                }
            }
        }

        self.clear_interrupts(dma_complete, samples_complete);

        if samples_complete {
            // The sticky signal must be visible before the bottom half's
            // state transition runs, per the ordering guarantee above.
            self.completion.signal();
        }

        if run_bottom_half {
            self.run_bottom_half(dma_complete, samples_complete);
        }
    }

    /// Newer firmware (PCI firmware ≥ `FWV_PCI_MIN_SPLIT_INT_CLEAR`) has two
    /// independent clear registers; older firmware clears both bits with a
    /// single write (spec.md §4.5).
    fn clear_interrupts(&self, dma_complete: bool, samples_complete: bool) {
        let firmware = self.inner.lock().firmware;
        if firmware.has_split_interrupt_clear() {
            if dma_complete {
                let _ = self
                    .regs
                    .write_full(RegisterBank::Dma, DMA_CLEAR_INTERRUPT_INDEX, 0b01);
            }
            if samples_complete {
                let _ = self
                    .regs
                    .write_full(RegisterBank::Dma, DMA_CLEAR_SAMP_COMP_INTERRUPT_INDEX, 1);
            }
        } else {
            let mut bits = 0u32;
            if dma_complete {
                bits |= 0b01;
            }
            if samples_complete {
                bits |= 0b10;
            }
            let _ = self
                .regs
                .write_full(RegisterBank::Dma, DMA_CLEAR_INTERRUPT_INDEX, bits);
        }
    }

    /// spec.md §4.5 Bottom half.
    fn run_bottom_half(&self, dma_complete: bool, samples_complete: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            DeviceState::XferFast if dma_complete => {
                if inner.unmap_on_completion {
                    if let Some(handle) = inner.current_dma_handle.take() {
                        drop(inner);
                        let _ = self.buffers.set_in_flight(handle, false);
                        inner = self.inner.lock();
                    }
                }
                inner.unmap_on_completion = false;
                inner.state = DeviceState::Idle;
            }
            DeviceState::XferBuffered if dma_complete => {
                // More sub-transfers are expected; the buffered-path loop
                // (device::buffered) drives the next one itself.
            }
            DeviceState::Acq | DeviceState::WRam if samples_complete => {
                inner.state = DeviceState::Idle;
                inner.mode = super::OperatingMode::Standby;
                drop(inner);
                let _ = self.write_mode(super::OperatingMode::Standby);
                self.completion.signal();
                return;
            }
            _ => {}
        }
        drop(inner);
        self.completion.signal();
    }
}
