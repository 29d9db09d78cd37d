//! Driver-buffered (deinterleaving) path (spec.md §4.7): chunked transfers
//! through the driver-owned scratch buffer, with optional per-channel
//! deinterleaving on the way out.

use std::sync::atomic::Ordering;

use crate::config::SAMPLE_BYTES;
use crate::error::{AdqError, Result};
use crate::hw::DmaDirection;
use crate::sync::WaitOutcome;

use super::{Device, DeviceState, OperatingMode, SessionId};

/// Which channel(s) a deinterleaved transfer extracts from the interleaved
/// stream, chosen once per call from which output buffers were supplied
/// (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterleaveMode {
    Both,
    Ch1Only,
    Ch2Only,
}

pub struct BufferedTransferRequest {
    /// Destination for channel 1 samples, or for the raw interleaved stream
    /// when `deinterleave` is false.
    pub ch1_user_addr: Option<usize>,
    pub ch2_user_addr: Option<usize>,
    pub total_samples: usize,
    pub start_sample: usize,
    pub deinterleave: bool,
    /// Always rejected with `NotImplemented` — the source material never
    /// implements an async driver-buffered path.
    pub async_transfer: bool,
    pub requested_mode: Option<OperatingMode>,
    pub session: SessionId,
}

impl Device {
    /// spec.md §4.7. Returns the number of samples actually written to the
    /// caller's buffer(s).
    pub fn buffered_transfer(&self, req: BufferedTransferRequest) -> Result<usize> {
        if req.async_transfer {
            return Err(AdqError::NotImplemented("asynchronous driver-buffered transfers"));
        }
        let mode = if req.deinterleave {
            match (req.ch1_user_addr, req.ch2_user_addr) {
                (Some(_), Some(_)) => DeinterleaveMode::Both,
                (Some(_), None) => DeinterleaveMode::Ch1Only,
                (None, Some(_)) => DeinterleaveMode::Ch2Only,
                (None, None) => {
                    return Err(AdqError::InvalidArg("deinterleave requested with no output buffer"))
                }
            }
        } else {
            if req.ch1_user_addr.is_none() {
                return Err(AdqError::InvalidArg("no output buffer supplied"));
            }
            DeinterleaveMode::Both
        };
        if req.total_samples == 0 {
            return Ok(0);
        }

        let _long = self.long.lock();
        {
            let inner = self.inner.lock();
            if inner.state != DeviceState::Idle {
                return Err(AdqError::Busy);
            }
        }

        let alignment = self.cfg.start_sample_alignment.max(1);
        let aligned_start = (req.start_sample / alignment) * alignment;
        let skip = req.start_sample - aligned_start;
        let double_frame = self.cfg.dma_frame_samples.saturating_mul(2).max(1);
        let wanted = req.total_samples + skip;
        let rem = wanted % double_frame;
        let aligned_count = if rem == 0 { wanted } else { wanted + (double_frame - rem) };

        let mode_changed = req.requested_mode.is_some();
        if let Some(requested) = req.requested_mode {
            self.write_mode(requested)?;
            self.inner.lock().mode = requested;
        }

        self.completion.reset();
        self.cancel_signal.store(false, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            inner.state = DeviceState::XferBuffered;
            inner.dma_owner = Some(req.session);
            inner.cancel = false;
        }

        let outcome = self.run_buffered_loop(&req, mode, aligned_count, skip);

        {
            let mut inner = self.inner.lock();
            inner.dma_owner = None;
            inner.state = DeviceState::Idle;
        }
        if mode_changed {
            self.write_mode(OperatingMode::Standby)?;
            self.inner.lock().mode = OperatingMode::Standby;
        }

        outcome
    }

    /// spec.md §4.7 step 3. `aligned_count` includes the leading skip
    /// samples; `skip` is subtracted from the output only on the first
    /// sub-transfer.
    fn run_buffered_loop(
        &self,
        req: &BufferedTransferRequest,
        mode: DeinterleaveMode,
        aligned_count: usize,
        initial_skip: usize,
    ) -> Result<usize> {
        let scratch_samples = self.cfg.scratch_default_samples;
        let mut remaining_incl_skip = aligned_count;
        let mut skip = initial_skip;
        let mut remaining_out = req.total_samples;
        // Position of this sub-transfer's first sample within the aligned
        // stream; sample 0 of the aligned stream is taken to be channel 1
        // (spec.md §4.7's "even indices -> ch1" convention, anchored at the
        // alignment boundary rather than the caller's requested start).
        let mut position = 0usize;
        let mut written = 0usize;
        let mut out_combined = 0usize;
        let mut out_ch1 = 0usize;
        let mut out_ch2 = 0usize;

        while remaining_incl_skip > 0 {
            if self.cancel_signal.load(Ordering::SeqCst) {
                return Err(AdqError::Cancelled);
            }
            let sub_transfer = remaining_incl_skip.min(scratch_samples);
            let scratch_region = self.buffers.clone_region(self.scratch_handle())?;

            self.completion.reset();
            self.program_and_kick_dma(
                self.scratch_handle(),
                scratch_region.kernel_addr,
                self.cfg.bytes_for_samples(sub_transfer),
                DmaDirection::DeviceToHost,
            )?;
            match self.completion.wait_interruptible(&self.cancel_signal) {
                WaitOutcome::Signaled => {}
                WaitOutcome::TimedOut | WaitOutcome::Interrupted => return Err(AdqError::Cancelled),
            }

            let new_samples = sub_transfer - skip;
            let take = new_samples.min(remaining_out);
            if take > 0 {
                let mut raw = vec![0u8; take * SAMPLE_BYTES];
                scratch_region.read_at(skip * SAMPLE_BYTES, &mut raw);
                let first_global_index = position + skip;

                match mode {
                    DeinterleaveMode::Both if !req.deinterleave => {
                        let dest = req.ch1_user_addr.unwrap();
                        self.write_user_bytes(dest, out_combined * SAMPLE_BYTES, &raw)?;
                        out_combined += take;
                    }
                    DeinterleaveMode::Both => {
                        let (ch1, ch2) = split_channels(&raw, first_global_index);
                        self.write_user_bytes(
                            req.ch1_user_addr.unwrap(),
                            out_ch1 * SAMPLE_BYTES,
                            &ch1,
                        )?;
                        self.write_user_bytes(
                            req.ch2_user_addr.unwrap(),
                            out_ch2 * SAMPLE_BYTES,
                            &ch2,
                        )?;
                        out_ch1 += ch1.len() / SAMPLE_BYTES;
                        out_ch2 += ch2.len() / SAMPLE_BYTES;
                    }
                    DeinterleaveMode::Ch1Only => {
                        let (ch1, _) = split_channels(&raw, first_global_index);
                        self.write_user_bytes(
                            req.ch1_user_addr.unwrap(),
                            out_ch1 * SAMPLE_BYTES,
                            &ch1,
                        )?;
                        out_ch1 += ch1.len() / SAMPLE_BYTES;
                    }
                    DeinterleaveMode::Ch2Only => {
                        let (_, ch2) = split_channels(&raw, first_global_index);
                        self.write_user_bytes(
                            req.ch2_user_addr.unwrap(),
                            out_ch2 * SAMPLE_BYTES,
                            &ch2,
                        )?;
                        out_ch2 += ch2.len() / SAMPLE_BYTES;
                    }
                }
            }

            written += take;
            remaining_out -= take;
            position += sub_transfer;
            remaining_incl_skip -= sub_transfer;
            skip = 0;
        }

        Ok(written)
    }

    /// Resolve `user_addr` to a mapped buffer and copy `data` in at `offset`
    /// bytes. The driver-buffered path's final hop is a host-to-host copy
    /// out of the scratch buffer, not a DMA, so it goes through the buffer
    /// table's address lookup rather than `Hardware::kick_dma`.
    fn write_user_bytes(&self, user_addr: usize, offset: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let lookup = self.buffers.lookup(user_addr, true)?;
        if lookup.bytes_remaining < offset + data.len() {
            return Err(AdqError::BufferTooSmall {
                needed: offset + data.len(),
                have: lookup.bytes_remaining,
            });
        }
        let region = self.buffers.clone_region(lookup.handle)?;
        let region_offset = (lookup.kernel_addr - region.kernel_addr) + offset;
        region.write_at(region_offset, data);
        Ok(())
    }
}

/// Split `raw` (samples starting at absolute stream position
/// `first_global_index`) into its channel-1 and channel-2 sample streams,
/// even indices to channel 1 (spec.md §4.7).
fn split_channels(raw: &[u8], first_global_index: usize) -> (Vec<u8>, Vec<u8>) {
    let samples = raw.len() / SAMPLE_BYTES;
    let mut ch1 = Vec::with_capacity(samples / 2 + 1);
    let mut ch2 = Vec::with_capacity(samples / 2 + 1);
    for i in 0..samples {
        let byte_range = i * SAMPLE_BYTES..(i + 1) * SAMPLE_BYTES;
        if (first_global_index + i) % 2 == 0 {
            ch1.extend_from_slice(&raw[byte_range]);
        } else {
            ch2.extend_from_slice(&raw[byte_range]);
        }
    }
    (ch1, ch2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::hw::SimHardware;
    use std::sync::Arc;

    fn open_device() -> Arc<Device> {
        Device::open(Arc::new(SimHardware::new()), DeviceConfig::default()).unwrap()
    }

    #[test]
    fn combined_buffered_transfer_fills_requested_sample_count() {
        let dev = open_device();
        let out = dev.buffers.allocate(4096, crate::dma::BufferOwner::Session(1)).unwrap();
        let out_addr = dev.buffers.map_to_userspace(out, 4096).unwrap();

        let written = dev
            .buffered_transfer(BufferedTransferRequest {
                ch1_user_addr: Some(out_addr),
                ch2_user_addr: None,
                total_samples: 512,
                start_sample: 0,
                deinterleave: false,
                async_transfer: false,
                requested_mode: Some(OperatingMode::PciRead),
                session: 1,
            })
            .unwrap();

        assert_eq!(written, 512);
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(dev.mode(), OperatingMode::Standby);
    }

    #[test]
    fn deinterleaved_transfer_splits_even_and_odd_samples() {
        let dev = open_device();
        let ch1 = dev.buffers.allocate(4096, crate::dma::BufferOwner::Session(1)).unwrap();
        let ch2 = dev.buffers.allocate(4096, crate::dma::BufferOwner::Session(1)).unwrap();
        let ch1_addr = dev.buffers.map_to_userspace(ch1, 4096).unwrap();
        let ch2_addr = dev.buffers.map_to_userspace(ch2, 4096).unwrap();

        let written = dev
            .buffered_transfer(BufferedTransferRequest {
                ch1_user_addr: Some(ch1_addr),
                ch2_user_addr: Some(ch2_addr),
                total_samples: 256,
                start_sample: 0,
                deinterleave: true,
                async_transfer: false,
                requested_mode: Some(OperatingMode::PciRead),
                session: 1,
            })
            .unwrap();

        assert_eq!(written, 256);
    }

    #[test]
    fn async_transfer_is_rejected() {
        let dev = open_device();
        let result = dev.buffered_transfer(BufferedTransferRequest {
            ch1_user_addr: Some(0x1000),
            ch2_user_addr: None,
            total_samples: 128,
            start_sample: 0,
            deinterleave: false,
            async_transfer: true,
            requested_mode: None,
            session: 1,
        });
        assert!(matches!(result, Err(AdqError::NotImplemented(_))));
    }
}
