//! Minimal command-line front end over `adq_core`: opens a simulated
//! device and runs one recording session to a file, for manual exercise
//! of the core without a real PCIe transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adq_core::config::{BoardRevision, DeviceConfig};
use adq_core::device::Device;
use adq_core::hw::SimHardware;
use adq_core::recording::sink::SingleFileBinarySink;
use adq_core::recording::{Engine, RecordingParams, RecordingSession};
use adq_core::session::{OpenFlags, Session};

struct Args {
    out: PathBuf,
    samples: usize,
    engine: Engine,
}

fn parse_args() -> Args {
    let mut out = PathBuf::from("capture.bin");
    let mut samples = 65536;
    let mut engine = Engine::Ram;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--out" => out = PathBuf::from(it.next().expect("--out requires a path")),
            "--samples" => samples = it.next().expect("--samples requires a count").parse().expect("not a number"),
            "--engine" => {
                engine = match it.next().expect("--engine requires a name").as_str() {
                    "ram" => Engine::Ram,
                    "pingpong" => Engine::PingPong,
                    "chained" => Engine::Chained,
                    other => panic!("unknown engine {other}"),
                }
            }
            other => panic!("unrecognized argument {other}"),
        }
    }
    Args { out, samples, engine }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let hw = Arc::new(SimHardware::new());
    let device = Device::open(hw, DeviceConfig::default()).expect("failed to open device");
    let session = Session::open(device.clone(), OpenFlags::empty());

    log::info!("recording {} samples via {:?} to {}", args.samples, args.engine, args.out.display());

    let params = RecordingParams {
        engine: args.engine,
        total_samples: args.samples,
        board_revision: BoardRevision::Standard,
        ..RecordingParams::default()
    };
    let sink = Box::new(SingleFileBinarySink::new(args.out.clone(), false, false));

    let recording = RecordingSession::start(device.clone(), params, sink, session.id()).expect("failed to start recording");
    loop {
        std::thread::sleep(Duration::from_millis(100));
        let progress = recording.progress();
        log::debug!("{} samples recorded, {} transfers", progress.samples_recorded, progress.transfer_count);
        if progress.samples_recorded as usize >= args.samples || recording.error().is_some() {
            break;
        }
    }

    match recording.join() {
        Ok(_sink) => log::info!("recording complete: {}", args.out.display()),
        Err(e) => log::error!("recording failed: {e}"),
    }

    device.set_standby().ok();
    session.close().ok();
}
