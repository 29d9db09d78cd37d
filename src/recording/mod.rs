//! Streaming recording engine (spec.md §3 RecordingSession, §4.8–§4.11):
//! one of three producer/consumer variants feeding a `Sink`, with shared
//! progress tracking and snapshotting.

mod chained;
mod pingpong;
mod ram;
pub mod sink;
pub mod srdc;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::BoardRevision;
use crate::device::{Device, SessionId};
use crate::error::{AdqError, Result};

pub use sink::Sink;

bitflags::bitflags! {
    /// spec.md §6 recording configuration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordingFlags: u32 {
        const DEINTERLEAVE           = 1 << 0;
        const ASSUME_DUAL_CHANNEL    = 1 << 1;
        const SAVE_AS_TEXT           = 1 << 2;
        const HEX_OUTPUT             = 1 << 3;
        const CONVERT_TO_SIGNED      = 1 << 4;
        const GENERATE_SRDC_FILE     = 1 << 5;
        const EMBED_SRDC_AS_AFS      = 1 << 6;
        const SAVE_TIMESTAMPS        = 1 << 7;
        const TIMESTAMPS_AS_TEXT     = 1 << 8;
        const APPEND                 = 1 << 9;
        const ABORT_OP_ON_TS_OVFL    = 1 << 10;
        const USE_TS_FIFO_OVFL_MARKER = 1 << 11;
        const DO_NOT_ARM             = 1 << 12;
        const DEEP_BUFFERING         = 1 << 13;
        const DO_SNAPSHOTS           = 1 << 14;
        const USE_UTILITY_BUFFERS    = 1 << 15;
    }
}

/// Which engine (C8/C9/C10) services a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// RAM-acquisition variant (spec.md §4.8).
    Ram,
    /// PCIe-buffered, ping-pong (spec.md §4.9).
    PingPong,
    /// PCIe-buffered, chained (spec.md §4.10), selected by `DEEP_BUFFERING`.
    Chained,
}

/// spec.md §3 RecordingSession parameters.
#[derive(Debug, Clone)]
pub struct RecordingParams {
    pub engine: Engine,
    /// 0 = indefinite.
    pub total_samples: usize,
    /// 0 = implementation default (the scratch buffer size).
    pub per_transfer_samples: usize,
    /// Per-cycle RAM acquisition size for `Engine::Ram` (spec.md §4.8's N).
    pub ram_acquire_samples: usize,
    /// Buffer count for `Engine::Chained` (spec.md §4.10).
    pub chain_buffer_count: usize,
    pub snapshot_period: Option<SnapshotPeriod>,
    pub snapshot_length_samples: usize,
    pub flags: RecordingFlags,
    pub board_revision: BoardRevision,
}

#[derive(Debug, Clone, Copy)]
pub enum SnapshotPeriod {
    Transfers(u64),
    Millis(u64),
}

impl Default for RecordingParams {
    fn default() -> Self {
        RecordingParams {
            engine: Engine::Ram,
            total_samples: 0,
            per_transfer_samples: 0,
            ram_acquire_samples: 64 * 1024,
            chain_buffer_count: 8,
            snapshot_period: None,
            snapshot_length_samples: 0,
            flags: RecordingFlags::empty(),
            board_revision: BoardRevision::Standard,
        }
    }
}

/// spec.md §3 RecordingSession: progress counters, guarded by the
/// session-local "progress mutex".
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub elapsed_ms: u64,
    pub samples_recorded: u64,
    pub transfer_count: u64,
    pub snapshot_counter: u64,
}

/// spec.md §3 RecordingSession: coarse lifecycle state a client can poll
/// without having to parse an error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Idle,
    InProgress,
    Complete,
    Error,
}

/// Machine-readable discriminant for `RecordingError`, one variant per
/// `AdqError` case the recording path can surface (spec.md §3/§7). Kept
/// separate from `AdqError` itself rather than storing it directly, since
/// `AdqError::FileIo`/`SystemTime` wrap non-`Clone` std error types and
/// `RecordingError` has to be `Clone` for `RecordingSession::error()` to
/// hand callers a snapshot without holding the progress lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingErrorKind {
    InvalidArg,
    InvalidMode,
    InvalidObjectHandle,
    Busy,
    DmaBufAllocFail,
    BufferTooSmall,
    InvalidDmaAddr,
    TimedOut,
    Cancelled,
    FifoOverflow,
    DcmSyncFailed,
    TimestampFifoOverflow,
    FileIo,
    SystemTime,
    DiskFull,
    OutOfMemory,
    ResourceAllocFailure,
    NotImplemented,
    NotImplementedInFirmware,
    Unexpected,
}

impl From<&AdqError> for RecordingErrorKind {
    fn from(e: &AdqError) -> Self {
        match e {
            AdqError::InvalidArg(_) => RecordingErrorKind::InvalidArg,
            AdqError::InvalidMode(_) => RecordingErrorKind::InvalidMode,
            AdqError::InvalidObjectHandle => RecordingErrorKind::InvalidObjectHandle,
            AdqError::Busy => RecordingErrorKind::Busy,
            AdqError::DmaBufAllocFail { .. } => RecordingErrorKind::DmaBufAllocFail,
            AdqError::BufferTooSmall { .. } => RecordingErrorKind::BufferTooSmall,
            AdqError::InvalidDmaAddr => RecordingErrorKind::InvalidDmaAddr,
            AdqError::TimedOut => RecordingErrorKind::TimedOut,
            AdqError::Cancelled => RecordingErrorKind::Cancelled,
            AdqError::FifoOverflow => RecordingErrorKind::FifoOverflow,
            AdqError::DcmSyncFailed => RecordingErrorKind::DcmSyncFailed,
            AdqError::TimestampFifoOverflow => RecordingErrorKind::TimestampFifoOverflow,
            AdqError::FileIo(_) => RecordingErrorKind::FileIo,
            AdqError::SystemTime(_) => RecordingErrorKind::SystemTime,
            AdqError::DiskFull => RecordingErrorKind::DiskFull,
            AdqError::OutOfMemory => RecordingErrorKind::OutOfMemory,
            AdqError::ResourceAllocFailure => RecordingErrorKind::ResourceAllocFailure,
            AdqError::NotImplemented(_) => RecordingErrorKind::NotImplemented,
            AdqError::NotImplementedInFirmware { .. } => RecordingErrorKind::NotImplementedInFirmware,
            AdqError::Unexpected(_) => RecordingErrorKind::Unexpected,
        }
    }
}

/// spec.md §3 RecordingSession error slot: a machine-readable kind plus a
/// short preamble, so a caller can e.g. distinguish `FifoOverflow` from
/// `TimedOut` without string-matching `message`.
#[derive(Debug, Clone)]
pub struct RecordingError {
    pub kind: RecordingErrorKind,
    pub message: String,
}

impl From<&AdqError> for RecordingError {
    fn from(e: &AdqError) -> Self {
        RecordingError { kind: RecordingErrorKind::from(e), message: e.to_string() }
    }
}

pub(crate) struct ProgressState {
    pub progress: Progress,
    pub status: RecordingStatus,
    pub error: Option<RecordingError>,
    pub snapshot: Vec<u8>,
    pub snapshot_samples: usize,
}

impl Default for ProgressState {
    fn default() -> Self {
        ProgressState {
            progress: Progress::default(),
            status: RecordingStatus::Idle,
            error: None,
            snapshot: Vec::new(),
            snapshot_samples: 0,
        }
    }
}

/// A running (or finished) recording session (spec.md §3). Exactly one is
/// active per device at a time; enforced by the device's JTAG/DMA-owner
/// roles being taken for the session's lifetime by its caller.
pub struct RecordingSession {
    state: Arc<Mutex<ProgressState>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<Box<dyn Sink>>>>,
}

impl RecordingSession {
    /// Start recording on `device` with `sink`, dispatching to the engine
    /// named in `params.engine` (spec.md §4.8–§4.10).
    pub fn start(
        device: Arc<Device>,
        params: RecordingParams,
        mut sink: Box<dyn Sink>,
        session: SessionId,
    ) -> Result<RecordingSession> {
        sink.init(params.total_samples)?;

        let state = Arc::new(Mutex::new(ProgressState::default()));
        state.lock().status = RecordingStatus::InProgress;
        let stop = Arc::new(AtomicBool::new(false));
        let state_for_thread = state.clone();
        let stop_for_thread = stop.clone();

        let thread = std::thread::spawn(move || {
            let result = match params.engine {
                Engine::Ram => ram::run(&device, &params, sink, &state_for_thread, &stop_for_thread, session),
                Engine::PingPong => {
                    pingpong::run(&device, &params, sink, &state_for_thread, &stop_for_thread, session)
                }
                Engine::Chained => {
                    chained::run(&device, &params, sink, &state_for_thread, &stop_for_thread, session)
                }
            };
            let (mut sink, outcome) = result;
            let release_result = sink.release();
            if let Err(e) = &outcome {
                let mut st = state_for_thread.lock();
                st.error = Some(RecordingError::from(e));
                st.status = RecordingStatus::Error;
            }
            match (outcome, release_result) {
                (Err(e), _) => Err(e),
                (Ok(()), Err(e)) => {
                    let mut st = state_for_thread.lock();
                    st.error = Some(RecordingError::from(&e));
                    st.status = RecordingStatus::Error;
                    Err(e)
                }
                (Ok(()), Ok(())) => {
                    state_for_thread.lock().status = RecordingStatus::Complete;
                    Ok(sink)
                }
            }
        });

        Ok(RecordingSession { state, stop, thread: Some(thread) })
    }

    /// Ask the session to stop at the next convenient point (spec.md §5
    /// "asks nicely"). Does not itself force the device to Standby; callers
    /// that need a hard stop should additionally call `Device::abort`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> Progress {
        self.state.lock().progress.clone()
    }

    /// spec.md §3/§7: `Idle`/`InProgress`/`Complete`/`Error`, settled by the
    /// recording thread before it exits so it is never observed mid-update.
    pub fn status(&self) -> RecordingStatus {
        self.state.lock().status
    }

    pub fn error(&self) -> Option<RecordingError> {
        self.state.lock().error.clone()
    }

    /// Read up to `max_samples` of the most recent snapshot plus the
    /// counter clients use to detect new data (spec.md §4.11).
    pub fn read_snapshot(&self, max_samples: usize) -> (Vec<u8>, u64) {
        let st = self.state.lock();
        let take = max_samples.min(st.snapshot_samples);
        let bytes = take * crate::config::SAMPLE_BYTES;
        (st.snapshot[..bytes].to_vec(), st.progress.snapshot_counter)
    }

    /// Block until the recording thread exits, returning the sink so the
    /// caller can inspect its final file path(s).
    pub fn join(mut self) -> Result<Box<dyn Sink>> {
        self.thread.take().expect("join called twice").join().expect("recording thread panicked")
    }
}

pub(crate) fn should_snapshot(params: &RecordingParams, transfer_count: u64, last_snapshot_ms: u64, elapsed_ms: u64) -> bool {
    if !params.flags.contains(RecordingFlags::DO_SNAPSHOTS) {
        return false;
    }
    match params.snapshot_period {
        Some(SnapshotPeriod::Transfers(n)) => n > 0 && transfer_count % n == 0,
        Some(SnapshotPeriod::Millis(ms)) => ms > 0 && elapsed_ms.saturating_sub(last_snapshot_ms) >= ms,
        None => false,
    }
}

pub(crate) fn take_snapshot(state: &Arc<Mutex<ProgressState>>, buf: &[u8], samples: usize, length: usize) {
    let take = samples.min(length.max(samples));
    let bytes = take * crate::config::SAMPLE_BYTES;
    let mut st = state.lock();
    st.snapshot.clear();
    st.snapshot.extend_from_slice(&buf[..bytes.min(buf.len())]);
    st.snapshot_samples = take;
    st.progress.snapshot_counter += 1;
}

pub(crate) fn srdc_paths(paths: &[PathBuf]) -> &[PathBuf] {
    paths
}

const _PROGRESS_POLL: Duration = Duration::from_millis(50);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::hw::SimHardware;
    use sink::NullSink;
    use std::sync::Arc as StdArc;

    #[test]
    fn ram_engine_records_requested_sample_count() {
        let hw = StdArc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        let params = RecordingParams {
            engine: Engine::Ram,
            total_samples: 2048,
            ram_acquire_samples: 1024,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device, params, Box::new(NullSink), 1).unwrap();
        let sink = session.join().unwrap();
        let _ = sink;
    }

    #[test]
    fn status_reflects_completion() {
        let hw = StdArc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        let params = RecordingParams {
            engine: Engine::Ram,
            total_samples: 1024,
            ram_acquire_samples: 1024,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device, params, Box::new(NullSink), 1).unwrap();
        assert_eq!(session.status(), RecordingStatus::InProgress);
        session.join().unwrap();
    }

    #[test]
    fn error_kind_survives_past_the_display_string() {
        // A device already busy in another mode makes the engine's own
        // `arm` call fail with `Busy` on its very first cycle.
        let hw = StdArc::new(SimHardware::new());
        let device = Device::open(hw, DeviceConfig::default()).unwrap();
        device.arm(crate::device::OperatingMode::PciRead, BoardRevision::Standard).unwrap();

        let params = RecordingParams {
            engine: Engine::Ram,
            total_samples: 1024,
            ram_acquire_samples: 1024,
            ..RecordingParams::default()
        };
        let session = RecordingSession::start(device, params, Box::new(NullSink), 1).unwrap();
        while session.status() == RecordingStatus::InProgress {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.status(), RecordingStatus::Error);
        let err = session.error().expect("error slot populated");
        assert_eq!(err.kind, RecordingErrorKind::Busy);
        assert!(session.join().is_err());
    }
}
