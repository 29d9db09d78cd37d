//! Sink implementations (spec.md §6 Sink contract): the recording engines
//! are entirely decoupled from on-disk format — deinterleaving, text/binary
//! encoding, and file segmentation all live here, behind one trait.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::SAMPLE_BYTES;
use crate::error::Result;

use super::srdc::{SrdcCallback, SrdcFields};

/// Wall-clock snapshot for an SRDC `RecArmTime*`/`RecEndTime*` pair: seconds
/// since the epoch plus an RFC 3339 rendering of the same instant (spec.md
/// §6; `original_source/`'s equivalent fields are "seconds since midnight
/// 1/1/1970" plus "a full string representation of date and time").
fn wall_clock_now() -> Result<(u64, String)> {
    let now = SystemTime::now();
    let secs = now.duration_since(SystemTime::UNIX_EPOCH)?.as_secs();
    Ok((secs, humantime::format_rfc3339(now).to_string()))
}

/// spec.md §6 Sink contract.
pub trait Sink: Send {
    fn init(&mut self, total_samples: usize) -> Result<()>;
    /// Called exactly once per processed chunk, in order.
    fn write(&mut self, buf: &[u8], samples: usize) -> Result<()>;
    /// Called exactly once, on end or on error.
    fn release(&mut self) -> Result<()>;
    fn set_srdc_gen_callback(&mut self, _cb: SrdcCallback) {}
    fn current_file_path(&self) -> Option<PathBuf> {
        None
    }
    fn current_file_samples(&self) -> usize {
        0
    }
}

/// Split an interleaved dual-channel byte buffer into its ch1/ch2 streams,
/// even sample indices to channel 1 (spec.md §4.7's convention, reused here
/// for DEINTERLEAVE sinks since a fresh recording always starts at the
/// beginning of its own stream).
fn split_channels(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let samples = raw.len() / SAMPLE_BYTES;
    let mut ch1 = Vec::with_capacity((samples / 2 + 1) * SAMPLE_BYTES);
    let mut ch2 = Vec::with_capacity((samples / 2 + 1) * SAMPLE_BYTES);
    for i in 0..samples {
        let range = i * SAMPLE_BYTES..(i + 1) * SAMPLE_BYTES;
        if i % 2 == 0 {
            ch1.extend_from_slice(&raw[range]);
        } else {
            ch2.extend_from_slice(&raw[range]);
        }
    }
    (ch1, ch2)
}

fn sample_at(buf: &[u8], index: usize, convert_to_signed: bool) -> u16 {
    let raw = u16::from_le_bytes([buf[index * SAMPLE_BYTES], buf[index * SAMPLE_BYTES + 1]]);
    if convert_to_signed {
        raw ^ 0x8000
    } else {
        raw
    }
}

fn write_text_samples(out: &mut impl Write, buf: &[u8], hex: bool, convert_to_signed: bool) -> Result<()> {
    let samples = buf.len() / SAMPLE_BYTES;
    for i in 0..samples {
        let v = sample_at(buf, i, convert_to_signed);
        if hex {
            writeln!(out, "{:04X}", v)?;
        } else {
            writeln!(out, "{}", v)?;
        }
    }
    Ok(())
}

/// Discards every sample; used when the client wants the data path
/// exercised (e.g. to measure throughput) without persisting anything.
#[derive(Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        Ok(())
    }
    fn write(&mut self, _buf: &[u8], _samples: usize) -> Result<()> {
        Ok(())
    }
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One binary file, raw interleaved samples, written in order.
pub struct SingleFileBinarySink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    samples_written: usize,
    append: bool,
    srdc: Option<SrdcSpec>,
}

struct SrdcSpec {
    callback: Option<SrdcCallback>,
    arm_time: (u64, String),
}

impl SingleFileBinarySink {
    pub fn new(path: impl Into<PathBuf>, append: bool, generate_srdc: bool) -> Self {
        SingleFileBinarySink {
            path: path.into(),
            file: None,
            samples_written: 0,
            append,
            srdc: if generate_srdc { Some(SrdcSpec { callback: None, arm_time: (0, String::new()) }) } else { None },
        }
    }
}

impl Sink for SingleFileBinarySink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)?;
        self.file = Some(BufWriter::new(file));
        if let Some(spec) = self.srdc.as_mut() {
            spec.arm_time = wall_clock_now()?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8], samples: usize) -> Result<()> {
        let bytes = samples * SAMPLE_BYTES;
        self.file.as_mut().expect("init called before write").write_all(&buf[..bytes])?;
        self.samples_written += samples;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        if let Some(spec) = self.srdc.as_mut() {
            let mut fields = default_srdc_fields(1, false, spec.arm_time.clone(), wall_clock_now()?);
            if let Some(cb) = spec.callback.as_mut() {
                cb(&self.path, &mut fields);
            }
            super::srdc::write_sidecar(&self.path, &fields)?;
        }
        Ok(())
    }

    fn set_srdc_gen_callback(&mut self, cb: SrdcCallback) {
        if let Some(spec) = self.srdc.as_mut() {
            spec.callback = Some(cb);
        }
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn current_file_samples(&self) -> usize {
        self.samples_written
    }
}

fn default_srdc_fields(channel_count: u32, text: bool, arm: (u64, String), end: (u64, String)) -> SrdcFields {
    SrdcFields {
        rec_arm_time_sec: arm.0,
        rec_arm_time_str: arm.1,
        rec_end_time_sec: end.0,
        rec_end_time_str: end.1,
        sample_format: super::srdc::SampleFormat::Unsigned,
        channel_id: 0,
        channel_count,
        file_format: if text { super::srdc::FileFormat::Text } else { super::srdc::FileFormat::Binary },
        sample_radix: 10,
        header_bytes: 0,
        operator_notes: String::new(),
    }
}

/// One binary file per `max_file_seg` samples; filenames get `_N` spliced
/// in before the extension past the first segment (spec.md S6).
pub struct SegmentedBinarySink {
    base_path: PathBuf,
    max_file_seg: usize,
    current_index: usize,
    current_file: Option<BufWriter<File>>,
    samples_in_current: usize,
    total_written: usize,
}

impl SegmentedBinarySink {
    pub fn new(base_path: impl Into<PathBuf>, max_file_seg: usize) -> Self {
        SegmentedBinarySink {
            base_path: base_path.into(),
            max_file_seg: max_file_seg.max(1),
            current_index: 0,
            current_file: None,
            samples_in_current: 0,
            total_written: 0,
        }
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        segment_path(&self.base_path, index)
    }

    fn roll(&mut self) -> Result<()> {
        if let Some(mut f) = self.current_file.take() {
            f.flush()?;
        }
        let path = self.segment_path(self.current_index);
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        self.current_file = Some(BufWriter::new(file));
        self.samples_in_current = 0;
        Ok(())
    }
}

/// Build `out_N.ext` from `out.ext`, the way the segmented sinks name their
/// files (spec.md S6: `out_0.bin` .. `out_3.bin`).
fn segment_path(base: &Path, index: usize) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = base.extension().map(|s| s.to_string_lossy().into_owned());
    let mut name = format!("{}_{}", stem, index);
    if let Some(ext) = ext {
        name.push('.');
        name.push_str(&ext);
    }
    base.with_file_name(name)
}

impl Sink for SegmentedBinarySink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        self.roll()
    }

    fn write(&mut self, buf: &[u8], mut samples: usize) -> Result<()> {
        let mut offset = 0usize;
        while samples > 0 {
            // Roll lazily, at the start of whichever call next has more to
            // write, rather than right after the chunk that filled the
            // segment: a write call landing exactly on the boundary would
            // otherwise leave `samples_in_current == max_file_seg` without
            // having rolled, and the next call's `room` would be stuck at
            // zero forever.
            if self.samples_in_current == self.max_file_seg {
                self.current_index += 1;
                self.roll()?;
            }
            let room = self.max_file_seg - self.samples_in_current;
            let chunk = samples.min(room);
            let bytes = chunk * SAMPLE_BYTES;
            self.current_file
                .as_mut()
                .expect("init called before write")
                .write_all(&buf[offset * SAMPLE_BYTES..offset * SAMPLE_BYTES + bytes])?;
            self.samples_in_current += chunk;
            self.total_written += chunk;
            offset += chunk;
            samples -= chunk;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut f) = self.current_file.take() {
            f.flush()?;
        }
        Ok(())
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        Some(self.segment_path(self.current_index))
    }

    fn current_file_samples(&self) -> usize {
        self.samples_in_current
    }
}

/// Two binary files, one per channel, deinterleaved on write.
pub struct DualFileBinarySink {
    path_a: PathBuf,
    path_b: PathBuf,
    file_a: Option<BufWriter<File>>,
    file_b: Option<BufWriter<File>>,
    generate_srdc: bool,
    arm_time: (u64, String),
}

impl DualFileBinarySink {
    pub fn new(path_a: impl Into<PathBuf>, path_b: impl Into<PathBuf>, generate_srdc: bool) -> Self {
        DualFileBinarySink {
            path_a: path_a.into(),
            path_b: path_b.into(),
            file_a: None,
            file_b: None,
            generate_srdc,
            arm_time: (0, String::new()),
        }
    }
}

impl Sink for DualFileBinarySink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        self.file_a = Some(BufWriter::new(
            OpenOptions::new().create(true).write(true).truncate(true).open(&self.path_a)?,
        ));
        self.file_b = Some(BufWriter::new(
            OpenOptions::new().create(true).write(true).truncate(true).open(&self.path_b)?,
        ));
        if self.generate_srdc {
            self.arm_time = wall_clock_now()?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8], samples: usize) -> Result<()> {
        let (a, b) = split_channels(&buf[..samples * SAMPLE_BYTES]);
        self.file_a.as_mut().expect("init called before write").write_all(&a)?;
        self.file_b.as_mut().expect("init called before write").write_all(&b)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut f) = self.file_a.take() {
            f.flush()?;
        }
        if let Some(mut f) = self.file_b.take() {
            f.flush()?;
        }
        if self.generate_srdc {
            let end_time = wall_clock_now()?;
            super::srdc::write_sidecar(&self.path_a, &default_srdc_fields(1, false, self.arm_time.clone(), end_time.clone()))?;
            super::srdc::write_sidecar(&self.path_b, &default_srdc_fields(1, false, self.arm_time.clone(), end_time))?;
        }
        Ok(())
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        Some(self.path_a.clone())
    }
}

/// One text file, decimal (or hex) ASCII, one sample per line.
pub struct SingleFileTextSink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    hex: bool,
    convert_to_signed: bool,
}

impl SingleFileTextSink {
    pub fn new(path: impl Into<PathBuf>, hex: bool, convert_to_signed: bool) -> Self {
        SingleFileTextSink { path: path.into(), file: None, hex, convert_to_signed }
    }
}

impl Sink for SingleFileTextSink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        self.file = Some(BufWriter::new(
            OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?,
        ));
        Ok(())
    }

    fn write(&mut self, buf: &[u8], samples: usize) -> Result<()> {
        write_text_samples(
            self.file.as_mut().expect("init called before write"),
            &buf[..samples * SAMPLE_BYTES],
            self.hex,
            self.convert_to_signed,
        )
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush()?;
        }
        Ok(())
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// Two text files, one per channel, deinterleaved on write, each with its
/// own SRDC sidecar when requested (spec.md S4).
pub struct DualFileTextSink {
    path_a: PathBuf,
    path_b: PathBuf,
    file_a: Option<BufWriter<File>>,
    file_b: Option<BufWriter<File>>,
    hex: bool,
    convert_to_signed: bool,
    generate_srdc: bool,
    arm_time: (u64, String),
}

impl DualFileTextSink {
    pub fn new(
        path_a: impl Into<PathBuf>,
        path_b: impl Into<PathBuf>,
        hex: bool,
        convert_to_signed: bool,
        generate_srdc: bool,
    ) -> Self {
        DualFileTextSink {
            path_a: path_a.into(),
            path_b: path_b.into(),
            file_a: None,
            file_b: None,
            hex,
            convert_to_signed,
            generate_srdc,
            arm_time: (0, String::new()),
        }
    }
}

impl Sink for DualFileTextSink {
    fn init(&mut self, _total_samples: usize) -> Result<()> {
        self.file_a = Some(BufWriter::new(
            OpenOptions::new().create(true).write(true).truncate(true).open(&self.path_a)?,
        ));
        self.file_b = Some(BufWriter::new(
            OpenOptions::new().create(true).write(true).truncate(true).open(&self.path_b)?,
        ));
        if self.generate_srdc {
            self.arm_time = wall_clock_now()?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8], samples: usize) -> Result<()> {
        let (a, b) = split_channels(&buf[..samples * SAMPLE_BYTES]);
        write_text_samples(self.file_a.as_mut().expect("init called before write"), &a, self.hex, self.convert_to_signed)?;
        write_text_samples(self.file_b.as_mut().expect("init called before write"), &b, self.hex, self.convert_to_signed)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut f) = self.file_a.take() {
            f.flush()?;
        }
        if let Some(mut f) = self.file_b.take() {
            f.flush()?;
        }
        if self.generate_srdc {
            let end_time = wall_clock_now()?;
            super::srdc::write_sidecar(&self.path_a, &default_srdc_fields(1, true, self.arm_time.clone(), end_time.clone()))?;
            super::srdc::write_sidecar(&self.path_b, &default_srdc_fields(1, true, self.arm_time.clone(), end_time))?;
        }
        Ok(())
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        Some(self.path_a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn interleaved(samples: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        for i in 0..samples {
            buf.extend_from_slice(&i.to_le_bytes());
        }
        buf
    }

    #[test]
    fn single_file_binary_sink_writes_all_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = SingleFileBinarySink::new(&path, false, false);
        sink.init(8).unwrap();
        let buf = interleaved(8);
        sink.write(&buf, 8).unwrap();
        sink.release().unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, buf);
    }

    #[test]
    fn dual_file_binary_sink_splits_even_odd() {
        let dir = tempdir().unwrap();
        let mut sink = DualFileBinarySink::new(dir.path().join("a.bin"), dir.path().join("b.bin"), false);
        sink.init(4).unwrap();
        sink.write(&interleaved(4), 4).unwrap();
        sink.release().unwrap();
        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("b.bin")).unwrap();
        assert_eq!(a, 0u16.to_le_bytes().iter().chain(2u16.to_le_bytes().iter()).copied().collect::<Vec<u8>>());
        assert_eq!(b, 1u16.to_le_bytes().iter().chain(3u16.to_le_bytes().iter()).copied().collect::<Vec<u8>>());
    }

    #[test]
    fn dual_file_text_sink_produces_decimal_lines_and_srdc() {
        let dir = tempdir().unwrap();
        let a_path = dir.path().join("a.txt");
        let b_path = dir.path().join("b.txt");
        let mut sink = DualFileTextSink::new(&a_path, &b_path, false, false, true);
        sink.init(10_240).unwrap();
        sink.write(&interleaved(10_240), 10_240).unwrap();
        sink.release().unwrap();
        let a_text = std::fs::read_to_string(&a_path).unwrap();
        let b_text = std::fs::read_to_string(&b_path).unwrap();
        assert_eq!(a_text.lines().count(), 5_120);
        assert_eq!(b_text.lines().count(), 5_120);
        let srdc = std::fs::read_to_string(super::super::srdc::sidecar_path(&a_path)).unwrap();
        assert!(srdc.contains("ChannelCount=1"));
        assert!(srdc.contains("SampleFormat=Unsigned"));
        assert!(srdc.contains("FileFormat=Text"));
        assert!(srdc.contains("SampleRadix=10"));
        assert!(!srdc.contains("RecArmTimeSec=0\n"));
        assert!(!srdc.contains("RecArmTimeStr=\n"));
    }

    #[test]
    fn segmented_binary_sink_splits_on_max_file_seg() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("out.bin");
        let mut sink = SegmentedBinarySink::new(&base, 100_000);
        sink.init(350_000).unwrap();
        sink.write(&vec![0u8; 350_000 * SAMPLE_BYTES], 350_000).unwrap();
        sink.release().unwrap();
        for (i, expected_samples) in [100_000usize, 100_000, 100_000, 50_000].into_iter().enumerate() {
            let path = segment_path(&base, i);
            let bytes = std::fs::metadata(&path).unwrap().len() as usize;
            assert_eq!(bytes, expected_samples * SAMPLE_BYTES);
        }
    }
}
