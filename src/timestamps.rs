//! Timestamp FIFO reader (C11, spec.md §4.12): a dedicated thread draining
//! the hardware timestamp FIFO to a binary or text file, independent of any
//! recording session's own data path.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::device::Device;
use crate::error::Result;
use crate::hw::RegisterBank;
use crate::regs::{
    ReadPolicy, DEV_STATUS_INDEX, STATUS_TS_FIFO_EMPTY, STATUS_TS_FIFO_MORE_AVAILABLE,
    STATUS_TS_FIFO_OVERFLOW,
};
use crate::sync::CompletionEvent;

/// Sentinel written twice when the previous batch was read from a full FIFO
/// and the overflow-marker flag is set (spec.md §4.12).
pub const OVERFLOW_MARKER: u64 = 0xF1F0_F1F0_F1F0_F1F0;

/// Cap on items drained in one pass before re-checking the stop flag.
const FIFO_DEPTH: usize = 256;
const POLL_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    Binary,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct TimestampReaderFlags {
    pub format: TimestampFormat,
    pub append: bool,
    pub insert_overflow_marker: bool,
}

/// A running timestamp reader (spec.md §3 TimestampReader).
pub struct TimestampReader {
    quit: Arc<CompletionEvent>,
    armed: Arc<CompletionEvent>,
    stop_flag: Arc<AtomicBool>,
    overflow_seen: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl TimestampReader {
    /// spec.md §4.12 Init: pick a writer, open the file, start the thread.
    /// The thread blocks on `Arm` before it drains anything.
    pub fn init(device: Arc<Device>, path: impl Into<PathBuf>, flags: TimestampReaderFlags) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(flags.append)
            .truncate(!flags.append)
            .open(&path)?;

        let quit = Arc::new(CompletionEvent::new());
        let armed = Arc::new(CompletionEvent::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let overflow_seen = Arc::new(AtomicBool::new(false));

        let thread = {
            let quit = quit.clone();
            let armed = armed.clone();
            let stop_flag = stop_flag.clone();
            let overflow_seen = overflow_seen.clone();
            std::thread::spawn(move || run(device, file, flags, quit, armed, stop_flag, overflow_seen))
        };

        Ok(TimestampReader { quit, armed, stop_flag, overflow_seen, thread: Some(thread) })
    }

    /// spec.md §4.12 Arm: must be called after the data-path arm so the FIFO
    /// isn't observed empty forever before an acquisition begins.
    pub fn arm(&self) {
        self.armed.signal();
    }

    /// Whether the hardware timestamp FIFO has ever been observed full since
    /// `init`, regardless of whether a marker was written for it (spec.md
    /// §4.12). Sticky: once set it never clears, unlike the per-batch
    /// `read_from_full` flag that only gates the next marker write.
    pub fn overflow_seen(&self) -> bool {
        self.overflow_seen.load(Ordering::SeqCst)
    }

    /// spec.md §4.12 Stop: request shutdown and join. The reader's own poll
    /// granularity (250 ms) bounds how long this blocks. Returns whether the
    /// FIFO was ever seen full over the reader's lifetime.
    pub fn stop(mut self) -> Result<bool> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.armed.signal();
        self.quit.signal();
        match self.thread.take() {
            Some(handle) => handle.join().expect("timestamp reader thread panicked")?,
            None => {}
        }
        Ok(self.overflow_seen.load(Ordering::SeqCst))
    }
}

fn write_item(out: &mut impl Write, value: u64, format: TimestampFormat) -> Result<()> {
    match format {
        TimestampFormat::Binary => out.write_u64::<LittleEndian>(value)?,
        TimestampFormat::Text => writeln!(out, "{}", value)?,
    }
    Ok(())
}

fn run(
    device: Arc<Device>,
    file: File,
    flags: TimestampReaderFlags,
    quit: Arc<CompletionEvent>,
    armed: Arc<CompletionEvent>,
    stop_flag: Arc<AtomicBool>,
    overflow_seen: Arc<AtomicBool>,
) -> Result<()> {
    if matches!(armed.wait_interruptible(&stop_flag), crate::sync::WaitOutcome::Interrupted) {
        return Ok(());
    }

    let mut writer = BufWriter::new(file);
    let mut read_from_full = false;

    while !stop_flag.load(Ordering::SeqCst) {
        let status = device.regs.read(RegisterBank::Device, DEV_STATUS_INDEX, ReadPolicy::FromHardware)?;
        let empty = status & STATUS_TS_FIFO_EMPTY != 0;
        let overflow = status & STATUS_TS_FIFO_OVERFLOW != 0;

        if empty {
            if overflow {
                read_from_full = true;
                overflow_seen.store(true, Ordering::SeqCst);
            }
            quit.wait_timeout(POLL_PERIOD, &stop_flag);
            continue;
        }

        let mut batch = Vec::new();
        loop {
            batch.push(device.regs.read_timestamp()?);
            if batch.len() >= FIFO_DEPTH {
                break;
            }
            let more = device.regs.read(RegisterBank::Device, DEV_STATUS_INDEX, ReadPolicy::FromHardware)?;
            if more & STATUS_TS_FIFO_MORE_AVAILABLE == 0 {
                break;
            }
        }

        if read_from_full && flags.insert_overflow_marker {
            write_item(&mut writer, OVERFLOW_MARKER, flags.format)?;
            write_item(&mut writer, OVERFLOW_MARKER, flags.format)?;
        }
        for ts in &batch {
            write_item(&mut writer, *ts, flags.format)?;
        }
        writer.flush()?;
        read_from_full = false;

        if status & STATUS_TS_FIFO_MORE_AVAILABLE == 0 {
            quit.wait_timeout(POLL_PERIOD, &stop_flag);
        }
    }
    writer.flush()?;
    Ok(())
}
