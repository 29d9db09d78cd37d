//! Synchronous DMA path (spec.md §4.6): a single-shot transfer to a
//! pre-allocated, pre-mapped buffer, optionally waited on synchronously.

use std::sync::atomic::Ordering;

use crate::dma::BufferHandle;
use crate::hw::{DmaDirection, RegisterBank};
use crate::regs::{
    DMA_CONTROL_INDEX, DMA_CONTROL_START_DEV_TO_HOST, DMA_CONTROL_START_HOST_TO_DEV,
    DMA_START_ADDR_HIGH_INDEX, DMA_START_ADDR_LOW_INDEX, DMA_TLP_COUNT_INDEX, DMA_TLP_SIZE_INDEX,
};
use crate::error::{AdqError, Result};

use super::{Device, DeviceState, OperatingMode, SessionId};

const TLP_DWORDS: u32 = 32;

pub struct FastDmaRequest {
    pub user_addr: usize,
    pub bytes: usize,
    pub direction: DmaDirection,
    pub async_transfer: bool,
    pub session: SessionId,
}

impl Device {
    /// spec.md §4.6. Returns once the transfer has started; if
    /// `async_transfer` is false it additionally waits for completion.
    pub fn start_fast_dma(&self, req: FastDmaRequest) -> Result<()> {
        if req.bytes % self.cfg.bytes_for_samples(self.cfg.dma_frame_samples) != 0 {
            return Err(AdqError::InvalidArg("byte count is not a multiple of the DMA frame size"));
        }
        if req.bytes < self.cfg.min_transfer_bytes {
            return Err(AdqError::InvalidArg("byte count below the minimum transfer size"));
        }
        if req.bytes > self.cfg.max_transfer_bytes {
            return Err(AdqError::InvalidArg("byte count above the maximum transfer size"));
        }

        let _long = self.long.lock();
        {
            let inner = self.inner.lock();
            if inner.state != DeviceState::Idle {
                return Err(AdqError::Busy);
            }
            // "PCI-read modes" (spec.md §4.6) covers both the plain PciRead
            // mode and continuous FIFO-buffered PCI acquisition, which the
            // ping-pong/chained recording engines (§4.9, §4.10) drive with
            // repeated fast-DMA requests rather than a single transfer.
            let mode_ok = match req.direction {
                DmaDirection::DeviceToHost => {
                    matches!(inner.mode, OperatingMode::PciRead | OperatingMode::FifoBufferedAcquire)
                }
                DmaDirection::HostToDevice => inner.mode == OperatingMode::RamWritePci,
            };
            if !mode_ok {
                return Err(AdqError::InvalidMode("operating mode does not match transfer direction"));
            }
        }

        let lookup = self.buffers.lookup(req.user_addr, true)?;
        if lookup.bytes_remaining < req.bytes {
            return Err(AdqError::BufferTooSmall {
                needed: req.bytes,
                have: lookup.bytes_remaining,
            });
        }

        self.completion.reset();
        self.cancel_signal.store(false, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            inner.cancel = false;
            inner.dma_transfers_started += 1;
            inner.state = DeviceState::XferFast;
            inner.dma_owner = Some(req.session);
            inner.current_dma_handle = Some(lookup.handle);
            inner.unmap_on_completion = false;
            inner.stats.bytes_transferred += req.bytes as u64;
        }

        self.program_and_kick_dma(lookup.handle, lookup.kernel_addr, req.bytes, req.direction)?;

        if !req.async_transfer {
            self.wait_interruptible()?;
        }
        Ok(())
    }

    /// The register-programming sequence shared by the public fast-DMA
    /// entrypoint and the driver-buffered path's internal sub-transfers
    /// (spec.md §4.6 step 5, reused by §4.7).
    pub(super) fn program_and_kick_dma(
        &self,
        handle: BufferHandle,
        kernel_addr: usize,
        bytes: usize,
        direction: DmaDirection,
    ) -> Result<()> {
        self.reset_dma_initiator()?;
        self.regs
            .write_full(RegisterBank::Dma, DMA_TLP_SIZE_INDEX, TLP_DWORDS)?;
        self.regs.write_full(
            RegisterBank::Dma,
            DMA_TLP_COUNT_INDEX,
            (bytes / crate::config::TLP_BYTES) as u32,
        )?;
        self.regs.write_full(
            RegisterBank::Dma,
            DMA_START_ADDR_LOW_INDEX,
            (kernel_addr as u64 & 0xFFFF_FFFF) as u32,
        )?;
        self.regs.write_full(
            RegisterBank::Dma,
            DMA_START_ADDR_HIGH_INDEX,
            (kernel_addr as u64 >> 32) as u32,
        )?;
        std::sync::atomic::fence(Ordering::SeqCst);
        let start_bit = match direction {
            DmaDirection::DeviceToHost => DMA_CONTROL_START_DEV_TO_HOST,
            DmaDirection::HostToDevice => DMA_CONTROL_START_HOST_TO_DEV,
        };
        self.regs.write(RegisterBank::Dma, DMA_CONTROL_INDEX, start_bit, start_bit)?;

        let region = self.buffers.clone_region(handle)?;
        let region_offset = kernel_addr - region.kernel_addr;
        self.hw.kick_dma(&region, region_offset, bytes, direction);
        Ok(())
    }

    /// spec.md §9's open question on `DEVF_DO_DMA_UNMAP`: only the
    /// `XferFast` path unmaps on completion in the source material, so the
    /// scratch/driver-buffered path never sets this.
    pub(crate) fn mark_unmap_on_completion(&self) {
        self.inner.lock().unmap_on_completion = true;
    }
}
