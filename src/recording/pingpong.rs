//! PCIe-buffered recording, ping-pong variant (C9, spec.md §4.9): two DMA
//! buffers, continuous FIFO-buffered PCI acquisition, producer and consumer
//! overlapped on a single thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::{Device, FastDmaRequest, OperatingMode, SessionId};
use crate::dma::{BufferHandle, BufferOwner, FreeCriterion};
use crate::error::Result;
use crate::hw::DmaDirection;

use super::sink::Sink;
use super::{should_snapshot, take_snapshot, ProgressState, RecordingParams};

const PROGRESS_UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub(super) fn run(
    device: &Arc<Device>,
    params: &RecordingParams,
    mut sink: Box<dyn Sink>,
    state: &Arc<Mutex<ProgressState>>,
    stop: &Arc<AtomicBool>,
    session: SessionId,
) -> (Box<dyn Sink>, Result<()>) {
    // spec.md §9's `DO_NOT_ARM` open question: a caller that has already put
    // the device into `FifoBufferedAcquire` mode itself (e.g. to eliminate
    // the race between session startup and the first sample window) skips
    // our own arm call, which `Device::arm` would otherwise reject with
    // `Busy` since the device is no longer in `Standby`.
    if !params.flags.contains(super::RecordingFlags::DO_NOT_ARM) {
        if let Err(e) = device.arm(OperatingMode::FifoBufferedAcquire, params.board_revision) {
            return (sink, Err(e));
        }
    }

    let per_transfer = if params.per_transfer_samples == 0 {
        device.cfg.scratch_default_samples
    } else {
        params.per_transfer_samples
    };
    let bytes = device.cfg.bytes_for_samples(per_transfer);

    let handles = [
        device.buffers.allocate(bytes, BufferOwner::Session(session)),
        device.buffers.allocate(bytes, BufferOwner::Session(session)),
    ];
    let handles: [BufferHandle; 2] = match (handles[0].as_ref(), handles[1].as_ref()) {
        (Ok(a), Ok(b)) => [*a, *b],
        _ => {
            for h in handles.into_iter().flatten() {
                let _ = device.buffers.free(FreeCriterion::ByHandle(h));
            }
            let _ = device.set_standby();
            return (sink, Err(crate::error::AdqError::ResourceAllocFailure));
        }
    };
    let addrs = [
        device.buffers.map_to_userspace(handles[0], bytes),
        device.buffers.map_to_userspace(handles[1], bytes),
    ];
    let [addr0, addr1] = addrs;
    let addrs = match (addr0, addr1) {
        (Ok(a), Ok(b)) => [a, b],
        (Err(e), _) | (_, Err(e)) => {
            for h in handles {
                let _ = device.buffers.free(FreeCriterion::ByHandle(h));
            }
            let _ = device.set_standby();
            return (sink, Err(e));
        }
    };

    let outcome = run_loop(device, params, sink.as_mut(), state, stop, session, &handles, &addrs, per_transfer, bytes);

    let _ = device.set_standby();
    for h in handles {
        let _ = device.buffers.free(FreeCriterion::ByHandle(h));
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
    handles: &[BufferHandle; 2],
    addrs: &[usize; 2],
    per_transfer: usize,
    bytes: usize,
) -> Result<()> {
    let target = params.total_samples;
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut last_snapshot_ms = 0u64;
    let mut emitted = 0usize;
    let mut transfer_count = 0u64;
    let mut pending_slot: Option<usize> = None;
    let mut i = 0usize;

    loop {
        if target != 0 && emitted >= target {
            break;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let slot = i % 2;
        device.start_fast_dma(FastDmaRequest {
            user_addr: addrs[slot],
            bytes,
            direction: DmaDirection::DeviceToHost,
            async_transfer: true,
            session,
        })?;

        if let Some(prev_slot) = pending_slot {
            emit_slot(device, sink, state, handles[prev_slot], per_transfer, &mut emitted, target, params, transfer_count, start, &mut last_snapshot_ms)?;
            transfer_count += 1;
        }

        device.wait_interruptible()?;
        pending_slot = Some(slot);
        i += 1;

        if last_progress.elapsed() >= PROGRESS_UPDATE_PERIOD {
            let mut st = state.lock();
            st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
            st.progress.transfer_count = transfer_count;
            last_progress = Instant::now();
        }
    }

    if let Some(prev_slot) = pending_slot {
        if target == 0 || emitted < target {
            emit_slot(device, sink, state, handles[prev_slot], per_transfer, &mut emitted, target, params, transfer_count, start, &mut last_snapshot_ms)?;
        }
    }

    let mut st = state.lock();
    st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_slot(
    device: &Arc<Device>,
    sink: &mut dyn Sink,
    state: &Arc<Mutex<ProgressState>>,
    handle: BufferHandle,
    per_transfer: usize,
    emitted: &mut usize,
    target: usize,
    params: &RecordingParams,
    transfer_count: u64,
    start: Instant,
    last_snapshot_ms: &mut u64,
) -> Result<()> {
    let to_emit = if target == 0 { per_transfer } else { per_transfer.min(target - *emitted) };
    let region = device.buffers.clone_region(handle)?;
    let mut buf = vec![0u8; device.cfg.bytes_for_samples(to_emit)];
    region.read_at(0, &mut buf);
    sink.write(&buf, to_emit)?;
    *emitted += to_emit;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    if should_snapshot(params, transfer_count + 1, *last_snapshot_ms, elapsed_ms) {
        take_snapshot(state, &buf, to_emit, params.snapshot_length_samples);
        *last_snapshot_ms = elapsed_ms;
    }
    state.lock().progress.samples_recorded = *emitted as u64;
    Ok(())
}
