//! PCIe-buffered recording, chained variant (C10, spec.md §4.10): an N-slot
//! producer/consumer pipeline guarded by counting semaphores, for sustained
//! rates a single ping-pong pair can't absorb consumer jitter.
//!
//! The producer's "ready" permits exactly track how many slots hold valid
//! data, so the consumer draining every outstanding permit before it sees
//! the shared stop flag is equivalent to the explicit "last valid slot"
//! sentinel described in spec.md §4.10 — simpler to model here since this
//! core's semaphore already distinguishes "woken with a permit" from "woken
//! by stop" (`Semaphore::acquire`'s return value).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PLMutex;

use crate::device::{Device, FastDmaRequest, OperatingMode, SessionId};
use crate::dma::{BufferHandle, BufferOwner, FreeCriterion};
use crate::error::{AdqError, Result};
use crate::hw::DmaDirection;
use crate::sync::Semaphore;

use super::sink::Sink;
use super::{should_snapshot, take_snapshot, ProgressState, RecordingParams};

const PROGRESS_UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub(super) fn run(
    device: &Arc<Device>,
    params: &RecordingParams,
    mut sink: Box<dyn Sink>,
    state: &Arc<PLMutex<ProgressState>>,
    stop: &Arc<AtomicBool>,
    session: SessionId,
) -> (Box<dyn Sink>, Result<()>) {
    // See pingpong.rs's identical `DO_NOT_ARM` handling: a pre-armed device
    // skips this call rather than failing it with `Busy`.
    if !params.flags.contains(super::RecordingFlags::DO_NOT_ARM) {
        if let Err(e) = device.arm(OperatingMode::FifoBufferedAcquire, params.board_revision) {
            return (sink, Err(e));
        }
    }

    let n = params.chain_buffer_count.max(2);
    let per_transfer = if params.per_transfer_samples == 0 {
        device.cfg.scratch_default_samples
    } else {
        params.per_transfer_samples
    };
    let bytes = device.cfg.bytes_for_samples(per_transfer);

    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        match device.buffers.allocate(bytes, BufferOwner::Session(session)) {
            Ok(h) => handles.push(h),
            Err(e) => {
                for h in handles {
                    let _ = device.buffers.free(FreeCriterion::ByHandle(h));
                }
                let _ = device.set_standby();
                return (sink, Err(e));
            }
        }
    }
    let mut addrs = Vec::with_capacity(n);
    for &h in &handles {
        match device.buffers.map_to_userspace(h, bytes) {
            Ok(a) => addrs.push(a),
            Err(e) => {
                for h in &handles {
                    let _ = device.buffers.free(FreeCriterion::ByHandle(*h));
                }
                let _ = device.set_standby();
                return (sink, Err(e));
            }
        }
    }

    // A slot can be larger than one fast-DMA transfer allows; split it into
    // consecutive sub-transfers the same way the chained buffer-list loop in
    // `original_source/`'s px14_recth_pcibuf_chained.cpp does, rounded down
    // to a whole DMA frame so every sub-transfer still satisfies
    // `start_fast_dma`'s frame-alignment check.
    let max_samples_per_subxfer = {
        let frame = device.cfg.dma_frame_samples.max(1);
        let frames = (device.cfg.max_transfer_bytes / device.cfg.bytes_for_samples(frame)).max(1);
        frame * frames
    };

    let free_sem = Arc::new(Semaphore::new(n));
    let ready_sem = Arc::new(Semaphore::new(0));
    let slot_samples: Arc<Vec<AtomicUsize>> = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect());
    let producer_done = Arc::new(AtomicBool::new(false));
    let producer_error: Arc<PLMutex<Option<String>>> = Arc::new(PLMutex::new(None));

    let producer_handle = {
        let device = device.clone();
        let free_sem = free_sem.clone();
        let ready_sem = ready_sem.clone();
        let slot_samples = slot_samples.clone();
        let producer_done = producer_done.clone();
        let producer_error = producer_error.clone();
        let stop = stop.clone();
        let addrs = addrs.clone();
        let target = params.total_samples;

        std::thread::spawn(move || {
            let mut produced = 0usize;
            let mut i = 0usize;
            'outer: loop {
                if target != 0 && produced >= target {
                    break;
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if !free_sem.acquire(&stop) {
                    break;
                }
                let slot = i % n;
                let this_valid = if target == 0 { per_transfer } else { per_transfer.min(target - produced) };

                // The slot's full buffer is always fetched (its trailing
                // samples past `this_valid` are simply never reported to
                // the consumer), split into as many sub-transfers as the
                // transport's max-transfer limit requires.
                let mut remaining = per_transfer;
                let mut offset_samples = 0usize;
                while remaining > 0 {
                    let sub_samples = remaining.min(max_samples_per_subxfer);
                    let sub_bytes = device.cfg.bytes_for_samples(sub_samples);
                    match device.start_fast_dma(FastDmaRequest {
                        user_addr: addrs[slot] + device.cfg.bytes_for_samples(offset_samples),
                        bytes: sub_bytes,
                        direction: DmaDirection::DeviceToHost,
                        async_transfer: false,
                        session,
                    }) {
                        Ok(()) => {
                            remaining -= sub_samples;
                            offset_samples += sub_samples;
                        }
                        Err(e) => {
                            if e.is_recording_fatal() {
                                *producer_error.lock() = Some(e.to_string());
                            }
                            break 'outer;
                        }
                    }
                }

                slot_samples[slot].store(this_valid, Ordering::SeqCst);
                produced += this_valid;
                ready_sem.release();
                i += 1;
            }
            producer_done.store(true, Ordering::SeqCst);
            ready_sem.wake_all();
        })
    };

    let outcome = run_consumer(
        device,
        params,
        sink.as_mut(),
        state,
        &free_sem,
        &ready_sem,
        &slot_samples,
        &producer_done,
        &handles,
        per_transfer,
    );

    stop.store(true, Ordering::SeqCst);
    free_sem.wake_all();
    producer_handle.join().expect("chained producer thread panicked");

    let outcome = match (outcome, producer_error.lock().take()) {
        (Err(e), _) => Err(e),
        (Ok(()), Some(msg)) => Err(AdqError::Unexpected(leak_str(msg))),
        (Ok(()), None) => Ok(()),
    };

    let _ = device.set_standby();
    for h in handles {
        let _ = device.buffers.free(FreeCriterion::ByHandle(h));
    }
    (sink, outcome)
}

/// `AdqError::Unexpected` carries a `&'static str`; the producer's error is
/// only known at runtime, so this deliberately leaks a short, one-time
/// diagnostic string rather than widening the error enum for one call site.
fn leak_str(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

#[allow(clippy::too_many_arguments)]
fn run_consumer(
    device: &Arc<Device>,
    params: &RecordingParams,
    sink: &mut dyn Sink,
    state: &Arc<PLMutex<ProgressState>>,
    free_sem: &Arc<Semaphore>,
    ready_sem: &Arc<Semaphore>,
    slot_samples: &Arc<Vec<AtomicUsize>>,
    producer_done: &Arc<AtomicBool>,
    handles: &[BufferHandle],
    per_transfer: usize,
) -> Result<()> {
    let n = handles.len();
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut last_snapshot_ms = 0u64;
    let mut emitted = 0usize;
    let mut transfer_count = 0u64;
    let mut slot_idx = 0usize;
    let _ = per_transfer;

    loop {
        if !ready_sem.acquire(producer_done) {
            break;
        }
        let slot = slot_idx % n;
        let samples = slot_samples[slot].load(Ordering::SeqCst);
        if samples > 0 {
            let region = device.buffers.clone_region(handles[slot])?;
            let mut buf = vec![0u8; device.cfg.bytes_for_samples(samples)];
            region.read_at(0, &mut buf);
            sink.write(&buf, samples)?;
            emitted += samples;
            transfer_count += 1;

            let elapsed_ms = start.elapsed().as_millis() as u64;
            if should_snapshot(params, transfer_count, last_snapshot_ms, elapsed_ms) {
                take_snapshot(state, &buf, samples, params.snapshot_length_samples);
                last_snapshot_ms = elapsed_ms;
            }
        }
        free_sem.release();
        slot_idx += 1;

        if last_progress.elapsed() >= PROGRESS_UPDATE_PERIOD {
            let mut st = state.lock();
            st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
            st.progress.samples_recorded = emitted as u64;
            st.progress.transfer_count = transfer_count;
            last_progress = Instant::now();
        } else {
            state.lock().progress.samples_recorded = emitted as u64;
        }
    }

    let mut st = state.lock();
    st.progress.elapsed_ms = start.elapsed().as_millis() as u64;
    st.progress.samples_recorded = emitted as u64;
    st.progress.transfer_count = transfer_count;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardRevision, DeviceConfig};
    use crate::hw::SimHardware;
    use crate::recording::sink::NullSink;
    use crate::recording::{Engine, RecordingSession};

    #[test]
    fn chained_engine_honors_do_not_arm_on_a_prearmed_device() {
        let hw = Arc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        device.arm(OperatingMode::FifoBufferedAcquire, BoardRevision::Standard).unwrap();

        let params = RecordingParams {
            engine: Engine::Chained,
            total_samples: 20_000,
            per_transfer_samples: 2048,
            chain_buffer_count: 4,
            board_revision: BoardRevision::Standard,
            flags: super::super::RecordingFlags::DO_NOT_ARM,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device.clone(), params, Box::new(NullSink), 12).unwrap();
        session.join().unwrap();
        assert_eq!(device.mode(), OperatingMode::Standby);
    }

    #[test]
    fn chained_engine_reaches_target_sample_count() {
        let hw = Arc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        let params = RecordingParams {
            engine: Engine::Chained,
            total_samples: 20_000,
            per_transfer_samples: 2048,
            chain_buffer_count: 4,
            board_revision: BoardRevision::Standard,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device.clone(), params, Box::new(NullSink), 9).unwrap();
        session.join().unwrap();
        assert_eq!(device.mode(), OperatingMode::Standby);
    }

    #[test]
    fn chained_engine_splits_slots_larger_than_max_transfer_bytes() {
        let hw = Arc::new(SimHardware::new());
        let mut cfg = DeviceConfig::default();
        // One DMA frame per sub-transfer, so a 4-frame slot must be issued
        // as 4 consecutive `start_fast_dma` calls (spec.md §4.10's split
        // rule, grounded on the chained buffer-list inner loop).
        cfg.max_transfer_bytes = cfg.bytes_for_samples(cfg.dma_frame_samples);
        let device = Device::open(hw, cfg.clone()).unwrap();
        let per_transfer = cfg.dma_frame_samples * 4;
        let params = RecordingParams {
            engine: Engine::Chained,
            total_samples: per_transfer * 2,
            per_transfer_samples: per_transfer,
            chain_buffer_count: 2,
            board_revision: BoardRevision::Standard,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device.clone(), params, Box::new(NullSink), 11).unwrap();
        session.join().unwrap();
        assert_eq!(device.interrupt_stats().dma_complete_count, 8);
    }

    #[test]
    fn chained_engine_honors_stop_request() {
        let hw = Arc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        let params = RecordingParams {
            engine: Engine::Chained,
            total_samples: 0,
            per_transfer_samples: 2048,
            chain_buffer_count: 4,
            board_revision: BoardRevision::Standard,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device, params, Box::new(NullSink), 10).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        session.request_stop();
        session.join().unwrap();
    }
}
