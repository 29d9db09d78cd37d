//! Device state machine (spec.md §4.4) and the session roles layered on
//! top of it (JTAG-owner, DMA-owner).

mod interrupt;
mod fast;
mod buffered;

pub use fast::FastDmaRequest;
pub use buffered::{BufferedTransferRequest, DeinterleaveMode};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BoardRevision, DeviceConfig, FirmwareVersions, InterruptStats};
use crate::dma::{scratch_bytes, BufferHandle, BufferOwner, DmaBufferTable};
use crate::error::{AdqError, Result};
use crate::hw::Hardware;
use crate::regs::clockgen::ClockGenerator;
use crate::regs::{RegisterBankCache, DEV_MODE_INDEX, DMA_CONTROL_INDEX, DMA_CONTROL_RESET_BIT};
use crate::sync::{CompletionEvent, LongLock, ShortLock, WaitOutcome};

pub type SessionId = u64;

/// spec.md §3 Device: `current device state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Acq,
    XferFast,
    XferBuffered,
    WRam,
}

/// spec.md §3 Device: `current operating mode`. `Standby` is the quiescent
/// resting mode (spec.md GLOSSARY); the others are the acquisition/transfer
/// modes the state machine and DMA paths validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Standby,
    RamAcquire,
    SabAcquire,
    FifoBufferedAcquire,
    PciRead,
    RamWritePci,
}

impl OperatingMode {
    fn is_acquisition(self) -> bool {
        matches!(
            self,
            OperatingMode::RamAcquire | OperatingMode::SabAcquire | OperatingMode::FifoBufferedAcquire
        )
    }
}

struct Inner {
    state: DeviceState,
    mode: OperatingMode,
    cancel: bool,
    dma_owner: Option<SessionId>,
    jtag_owner: Option<SessionId>,
    stats: InterruptStats,
    acquisitions_started: u64,
    dma_transfers_started: u64,
    dcm_needs_reset: bool,
    unmap_on_completion: bool,
    current_dma_handle: Option<BufferHandle>,
    firmware: FirmwareVersions,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            state: DeviceState::Idle,
            mode: OperatingMode::Standby,
            cancel: false,
            dma_owner: None,
            jtag_owner: None,
            stats: InterruptStats::default(),
            acquisitions_started: 0,
            dma_transfers_started: 0,
            dcm_needs_reset: true,
            unmap_on_completion: false,
            current_dma_handle: None,
            firmware: FirmwareVersions::default(),
        }
    }
}

/// spec.md §3 Device. Owns the register cache, the DMA buffer table, and
/// the short/long lock pair the rest of the core nests under (spec.md §5).
pub struct Device {
    pub hw: Arc<dyn Hardware>,
    pub regs: RegisterBankCache,
    pub clockgen: ClockGenerator,
    pub cfg: DeviceConfig,
    pub buffers: DmaBufferTable,
    inner: ShortLock<Inner>,
    long: LongLock<()>,
    completion: CompletionEvent,
    cancel_signal: AtomicBool,
    scratch: BufferHandle,
    scratch_user_addr: usize,
    ref_count: std::sync::atomic::AtomicUsize,
}

impl Device {
    /// Open one device: build the register/DMA/clock-generator layers,
    /// allocate the driver-internal scratch buffer, and install this
    /// device's interrupt handler with the transport (spec.md §3 Device
    /// lifecycle, §4.7 scratch buffer).
    pub fn open(hw: Arc<dyn Hardware>, cfg: DeviceConfig) -> Result<Arc<Device>> {
        let buffers = DmaBufferTable::new(hw.clone());
        let scratch_size = scratch_bytes(&cfg);
        let scratch_handle = buffers.allocate(scratch_size, BufferOwner::Scratch)?;
        let scratch_user_addr = buffers.map_to_userspace(scratch_handle, scratch_size)?;

        let device = Arc::new(Device {
            regs: RegisterBankCache::new(hw.clone()),
            clockgen: ClockGenerator::new(hw.clone()),
            cfg,
            buffers,
            inner: ShortLock::new(Inner::default()),
            long: LongLock::new(()),
            completion: CompletionEvent::new(),
            cancel_signal: AtomicBool::new(false),
            scratch: scratch_handle,
            scratch_user_addr,
            ref_count: std::sync::atomic::AtomicUsize::new(0),
            hw: hw.clone(),
        });

        let weak = Arc::downgrade(&device);
        hw.install_interrupt_handler(Arc::new(move || {
            if let Some(device) = weak.upgrade() {
                device.on_interrupt();
            }
        }));

        device.clockgen.initialize(&device.regs, device.cfg.board_revision)?;
        let versions = device.hw.read_firmware_versions()?;
        device.set_firmware_versions(versions);

        Ok(device)
    }

    pub fn scratch_handle(&self) -> BufferHandle {
        self.scratch
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn mode(&self) -> OperatingMode {
        self.inner.lock().mode
    }

    pub fn interrupt_stats(&self) -> InterruptStats {
        self.inner.lock().stats
    }

    pub fn firmware_versions(&self) -> FirmwareVersions {
        self.inner.lock().firmware
    }

    pub fn set_firmware_versions(&self, versions: FirmwareVersions) {
        self.inner.lock().firmware = versions;
    }

    pub fn acquire_session(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a session reference. Returns true if this was the last one, in
    /// which case the caller must drain DMA, return to standby, and free
    /// all user buffers (spec.md §3 Session invariants).
    pub fn release_session(&self, id: SessionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.jtag_owner == Some(id) {
            inner.jtag_owner = None;
        }
        if inner.dma_owner == Some(id) {
            inner.dma_owner = None;
        }
        drop(inner);
        self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn try_take_jtag_owner(&self, id: SessionId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.jtag_owner {
            None => {
                inner.jtag_owner = Some(id);
                Ok(())
            }
            Some(owner) if owner == id => Ok(()),
            Some(_) => Err(AdqError::Busy),
        }
    }

    pub fn release_jtag_owner(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        if inner.jtag_owner == Some(id) {
            inner.jtag_owner = None;
        }
    }

    /// Reset the DMA initiator: terminates any in-flight asynchronous
    /// transfer cleanly (spec.md §4.4, §4.6).
    fn reset_dma_initiator(&self) -> Result<()> {
        self.regs.write(
            crate::hw::RegisterBank::Dma,
            DMA_CONTROL_INDEX,
            DMA_CONTROL_RESET_BIT,
            DMA_CONTROL_RESET_BIT,
        )?;
        self.regs.write(
            crate::hw::RegisterBank::Dma,
            DMA_CONTROL_INDEX,
            0,
            DMA_CONTROL_RESET_BIT,
        )
    }

    fn write_mode(&self, mode: OperatingMode) -> Result<()> {
        self.regs
            .write_full(crate::hw::RegisterBank::Device, DEV_MODE_INDEX, mode as u32)
    }

    /// Enter `mode` from `Standby` (spec.md §4.4 arming invariants). Any
    /// mode but `Standby` goes through this path; `set_standby` is separate.
    pub fn arm(&self, mode: OperatingMode, board_revision: BoardRevision) -> Result<()> {
        if mode == OperatingMode::Standby {
            return self.set_standby();
        }
        let _long = self.long.lock();
        {
            let current = self.inner.lock().mode;
            if current != OperatingMode::Standby {
                return Err(AdqError::Busy);
            }
        }

        self.completion.reset();
        self.cancel_signal.store(false, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            inner.acquisitions_started += 1;
        }
        self.reset_dma_initiator()?;

        let needs_dcm_reset = self.inner.lock().dcm_needs_reset;
        if needs_dcm_reset {
            self.clockgen.reset_dcms(&self.regs)?;
            let _ = board_revision;
        }

        self.write_mode(mode)?;

        let mut inner = self.inner.lock();
        inner.mode = mode;
        inner.cancel = false;
        // Only the two on-board acquisition modes hold the device busy
        // until a samples-complete interrupt; PciRead/RamWritePci/
        // FifoBufferedAcquire leave it Idle so a fast-DMA or buffered
        // transfer can follow immediately (spec.md §4.6/§4.7's mode gates
        // both require Idle).
        if matches!(mode, OperatingMode::RamAcquire | OperatingMode::SabAcquire) {
            inner.state = DeviceState::Acq;
        }
        Ok(())
    }

    /// Return to Standby: reset the DMA initiator first so any in-flight
    /// transfer is terminated cleanly, then write the mode (spec.md §4.4).
    pub fn set_standby(&self) -> Result<()> {
        let _long = self.long.lock();
        self.reset_dma_initiator()?;
        self.write_mode(OperatingMode::Standby)?;
        let mut inner = self.inner.lock();
        inner.mode = OperatingMode::Standby;
        inner.state = DeviceState::Idle;
        Ok(())
    }

    /// spec.md §4.4 Abort. `cancel` distinguishes a user-requested
    /// cancellation from a timeout; only cancellation (or any PCI-based
    /// mode) forces Standby.
    pub fn abort(&self, cancel: bool) -> Result<()> {
        let _long = self.long.lock();
        let (state, mode) = {
            let inner = self.inner.lock();
            (inner.state, inner.mode)
        };
        if matches!(state, DeviceState::XferFast | DeviceState::XferBuffered) {
            self.reset_dma_initiator()?;
        }
        let pci_based = matches!(
            mode,
            OperatingMode::PciRead | OperatingMode::RamWritePci | OperatingMode::FifoBufferedAcquire
        );
        if cancel || pci_based {
            self.write_mode(OperatingMode::Standby)?;
            let mut inner = self.inner.lock();
            inner.mode = OperatingMode::Standby;
        }
        {
            let mut inner = self.inner.lock();
            inner.cancel = true;
            inner.state = DeviceState::Idle;
        }
        self.completion.signal();
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancel
    }

    /// spec.md §4.4 Wait-interruptible.
    pub fn wait_interruptible(&self) -> Result<()> {
        match self.completion.wait_interruptible(&self.cancel_signal) {
            WaitOutcome::Signaled => self.finish_wait(),
            WaitOutcome::Interrupted | WaitOutcome::TimedOut => {
                self.abort(true)?;
                Err(AdqError::Cancelled)
            }
        }
    }

    /// spec.md §4.4 Wait-timeout: on expiry, abort(timeout=true), which
    /// does not force Standby.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        match self.completion.wait_timeout(timeout, &self.cancel_signal) {
            WaitOutcome::Signaled => self.finish_wait(),
            WaitOutcome::Interrupted => {
                self.abort(true)?;
                Err(AdqError::Cancelled)
            }
            WaitOutcome::TimedOut => {
                self.abort(false)?;
                Err(AdqError::TimedOut)
            }
        }
    }

    fn finish_wait(&self) -> Result<()> {
        let (cancelled, mode) = {
            let inner = self.inner.lock();
            (inner.cancel, inner.mode)
        };
        if cancelled {
            return Err(AdqError::Cancelled);
        }
        if mode == OperatingMode::FifoBufferedAcquire {
            let status = self.regs.read(
                crate::hw::RegisterBank::Device,
                crate::regs::DEV_STATUS_INDEX,
                crate::regs::ReadPolicy::FromHardware,
            )?;
            if status & crate::regs::STATUS_PCI_FIFO_FULL != 0 {
                return Err(AdqError::FifoOverflow);
            }
        }
        Ok(())
    }

    /// Ask the transport to signal a pending wait without touching mode or
    /// DMA (used by recording-session soft-stop before a forced abort).
    pub fn request_cancel(&self) {
        self.cancel_signal.store(true, Ordering::SeqCst);
    }
}
