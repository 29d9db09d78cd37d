//! Control, DMA, and recording core for a dual-channel PCIe analog
//! acquisition board (spec.md OVERVIEW).
//!
//! This crate is transport-agnostic: it models the device state machine,
//! register I/O, DMA buffer table, and the three streaming recording
//! engines against a `hw::Hardware` trait. A real driver wires that trait
//! to an actual PCIe BAR and DMA allocator; `hw::SimHardware` wires it to
//! an in-process model for testing and for the bundled `adqd` front end.

pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod hw;
pub mod ioctl;
pub mod recording;
pub mod regs;
pub mod session;
pub mod sync;
pub mod timestamps;

pub use config::{BoardRevision, DeviceConfig};
pub use device::{Device, DeviceState, OperatingMode, SessionId};
pub use error::{AdqError, Result};
pub use session::{OpenFlags, Session};
