//! RAM-acquisition recording engine (C8, spec.md §4.8): acquire N samples
//! into board RAM, read them out through the driver-buffered path into a
//! Sink, repeat until the requested total is reached or a stop is asked for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::{BufferedTransferRequest, Device, OperatingMode, SessionId};
use crate::dma::{BufferOwner, FreeCriterion};
use crate::error::Result;

use super::sink::Sink;
use super::{take_snapshot, ProgressState, RecordingParams};

const PROGRESS_UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub(super) fn run(
    device: &Arc<Device>,
    params: &RecordingParams,
    mut sink: Box<dyn Sink>,
    state: &Arc<Mutex<ProgressState>>,
    stop: &Arc<AtomicBool>,
    session: SessionId,
) -> (Box<dyn Sink>, Result<()>) {
    let cycle_samples = params.ram_acquire_samples.max(1);
    let cycle_bytes = device.cfg.bytes_for_samples(cycle_samples);
    let use_utility = params.flags.contains(super::RecordingFlags::USE_UTILITY_BUFFERS);

    // `USE_UTILITY_BUFFERS` (spec.md §9): reuse the slot-0 utility buffer
    // across sessions instead of paying for a fresh `alloc_coherent` every
    // time, the way `InitRecordingBuffers`'s utility-buffer path does in the
    // original driver. Only one RAM-engine session runs per device at a
    // time, so a single fixed slot is enough.
    let (out, out_addr) = if use_utility {
        match device.buffers.get_or_alloc_utility(0, cycle_bytes) {
            Ok(pair) => pair,
            Err(e) => return (sink, Err(e)),
        }
    } else {
        let out = match device.buffers.allocate(cycle_bytes, BufferOwner::Session(session)) {
            Ok(h) => h,
            Err(e) => return (sink, Err(e)),
        };
        let out_addr = match device.buffers.map_to_userspace(out, cycle_bytes) {
            Ok(a) => a,
            Err(e) => {
                let _ = device.buffers.free(FreeCriterion::ByHandle(out));
                return (sink, Err(e));
            }
        };
        (out, out_addr)
    };

    let outcome = run_loop(device, params, sink.as_mut(), state, stop, session, out, out_addr, cycle_samples);

    if !use_utility {
        let _ = device.buffers.free(FreeCriterion::ByHandle(out));
    }
    (sink, outcome)
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    device: &Arc<Device>,
    params: &RecordingParams,
    sink: &mut dyn Sink,
    state: &Arc<Mutex<ProgressState>>,
    stop: &Arc<AtomicBool>,
    session: SessionId,
    out: crate::dma::BufferHandle,
    out_addr: usize,
    cycle_samples: usize,
) -> Result<()> {
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut remaining = if params.total_samples == 0 { usize::MAX } else { params.total_samples };
    let mut cycles = 0u64;

    while remaining > 0 {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        // `DO_NOT_ARM` (spec.md §9) only covers the first cycle: a device
        // that completes a RAM acquisition always reverts to `Standby`
        // (device::interrupt's bottom half), so every later cycle still
        // needs its own arm regardless of the flag.
        if cycles > 0 || !params.flags.contains(super::RecordingFlags::DO_NOT_ARM) {
            device.arm(OperatingMode::RamAcquire, params.board_revision)?;
        }
        device.wait_interruptible()?;

        let this_cycle = cycle_samples.min(remaining);
        let written = device.buffered_transfer(BufferedTransferRequest {
            ch1_user_addr: Some(out_addr),
            ch2_user_addr: None,
            total_samples: this_cycle,
            start_sample: 0,
            deinterleave: false,
            async_transfer: false,
            requested_mode: Some(OperatingMode::PciRead),
            session,
        })?;

        let region = device.buffers.clone_region(out)?;
        let mut buf = vec![0u8; device.cfg.bytes_for_samples(written)];
        region.read_at(0, &mut buf);
        sink.write(&buf, written)?;

        if params.flags.contains(super::RecordingFlags::DO_SNAPSHOTS) {
            // This variant snapshots by re-reading the same RAM contents it
            // just pulled rather than tapping the producer mid-stream
            // (spec.md §4.8): the buffer we already have in hand is exactly
            // that re-read.
            take_snapshot(state, &buf, written, params.snapshot_length_samples);
        }

        remaining = remaining.saturating_sub(written);
        cycles += 1;

        if last_progress.elapsed() >= PROGRESS_UPDATE_PERIOD {
            let mut st = state.lock();
            st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
            st.progress.samples_recorded += written as u64;
            st.progress.transfer_count = cycles;
            last_progress = Instant::now();
        } else {
            state.lock().progress.samples_recorded += written as u64;
        }

        if written == 0 {
            break;
        }
    }

    let mut st = state.lock();
    st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
    st.progress.transfer_count = cycles;
    Ok(())
}
