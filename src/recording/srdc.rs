//! Sidecar metadata file (spec.md §6 SRDC). Treated as opaque by the rest
//! of the crate beyond the field list spec.md names — the original format's
//! exact binary layout is out of scope (SPEC_FULL.md §12).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Binary,
    Text,
}

/// spec.md §6: the fields the recording engine writes into each sidecar.
#[derive(Debug, Clone)]
pub struct SrdcFields {
    pub rec_arm_time_sec: u64,
    pub rec_arm_time_str: String,
    pub rec_end_time_sec: u64,
    pub rec_end_time_str: String,
    pub sample_format: SampleFormat,
    pub channel_id: u32,
    pub channel_count: u32,
    pub file_format: FileFormat,
    pub sample_radix: u32,
    pub header_bytes: usize,
    pub operator_notes: String,
}

/// Hook invoked for each created sidecar (spec.md §6 `SetSrdcGenCallback`).
pub type SrdcCallback = Box<dyn FnMut(&Path, &mut SrdcFields) + Send>;

pub const SRDC_EXTENSION: &str = "srdc";

/// `a.txt` -> `a.txt.srdc`, keyed by the data file's own pathname plus the
/// fixed extension (spec.md §6).
pub fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".");
    name.push(SRDC_EXTENSION);
    PathBuf::from(name)
}

pub fn write_sidecar(data_path: &Path, fields: &SrdcFields) -> Result<()> {
    let mut file = File::create(sidecar_path(data_path))?;
    writeln!(file, "RecArmTimeSec={}", fields.rec_arm_time_sec)?;
    writeln!(file, "RecArmTimeStr={}", fields.rec_arm_time_str)?;
    writeln!(file, "RecEndTimeSec={}", fields.rec_end_time_sec)?;
    writeln!(file, "RecEndTimeStr={}", fields.rec_end_time_str)?;
    writeln!(
        file,
        "SampleFormat={}",
        match fields.sample_format {
            SampleFormat::Signed => "Signed",
            SampleFormat::Unsigned => "Unsigned",
        }
    )?;
    writeln!(file, "ChannelId={}", fields.channel_id)?;
    writeln!(file, "ChannelCount={}", fields.channel_count)?;
    writeln!(
        file,
        "FileFormat={}",
        match fields.file_format {
            FileFormat::Binary => "Binary",
            FileFormat::Text => "Text",
        }
    )?;
    writeln!(file, "SampleRadix={}", fields.sample_radix)?;
    writeln!(file, "HeaderBytes={}", fields.header_bytes)?;
    writeln!(file, "OperatorNotes={}", fields.operator_notes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecar_path_appends_fixed_extension() {
        let p = sidecar_path(Path::new("/tmp/out.bin"));
        assert_eq!(p, PathBuf::from("/tmp/out.bin.srdc"));
    }

    #[test]
    fn write_sidecar_contains_all_fields() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("a.bin");
        let fields = SrdcFields {
            rec_arm_time_sec: 10,
            rec_arm_time_str: "arm".into(),
            rec_end_time_sec: 20,
            rec_end_time_str: "end".into(),
            sample_format: SampleFormat::Signed,
            channel_id: 2,
            channel_count: 1,
            file_format: FileFormat::Binary,
            sample_radix: 16,
            header_bytes: 4,
            operator_notes: "note".into(),
        };
        write_sidecar(&data, &fields).unwrap();
        let text = std::fs::read_to_string(sidecar_path(&data)).unwrap();
        for needle in [
            "RecArmTimeSec=10",
            "RecEndTimeSec=20",
            "SampleFormat=Signed",
            "ChannelId=2",
            "ChannelCount=1",
            "FileFormat=Binary",
            "SampleRadix=16",
            "HeaderBytes=4",
            "OperatorNotes=note",
        ] {
            assert!(text.contains(needle), "missing {needle} in {text}");
        }
    }
}
