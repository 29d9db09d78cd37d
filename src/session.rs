//! Session: the open-handle layer above `Device` (spec.md §3 Session).
//! Wraps the device's session-scoped roles (JTAG-owner, DMA-owner) and
//! guarantees the close-time cleanup invariant: releasing the last open
//! session on a device drains its DMA, returns it to standby, and frees
//! every user buffer it allocated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{Device, SessionId};
use crate::dma::FreeCriterion;
use crate::error::Result;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

bitflags::bitflags! {
    /// spec.md §3 Session `open-flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 1 << 0;
        const EXCLUSIVE_JTAG = 1 << 1;
    }
}

/// An open handle to a `Device` (spec.md §3 Session). Dropping it (or
/// calling `close` explicitly) releases any role it holds; if it was the
/// device's last open session, the device is drained back to a quiescent
/// state first.
pub struct Session {
    id: SessionId,
    device: Arc<Device>,
    flags: OpenFlags,
    closed: bool,
}

impl Session {
    /// Open a new session on `device` (spec.md §3 Device lifecycle: `refCount`
    /// increments on open).
    pub fn open(device: Arc<Device>, flags: OpenFlags) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        device.acquire_session();
        Session { id, device, flags, closed: false }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Take the JTAG-owner role for this session (spec.md §3 Device
    /// invariant: "JTAG-owner is either unset or equal to an open session").
    pub fn take_jtag_owner(&self) -> Result<()> {
        self.device.try_take_jtag_owner(self.id)
    }

    pub fn release_jtag_owner(&self) {
        self.device.release_jtag_owner(self.id);
    }

    /// Close the session explicitly. Equivalent to dropping it, but lets
    /// the caller observe the result of the last-session cleanup.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let was_last = self.device.release_session(self.id);
        self.device.buffers.free(FreeCriterion::BySession(self.id))?;
        if was_last {
            self.device.set_standby()?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
