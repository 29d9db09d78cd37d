//! DMA buffer table (spec.md §4.3, §8 property 1/2): allocation, user-space
//! mapping, address lookup, and the several flavors of "free".
//!
//! Descriptors live in a `Vec` behind the device's short lock, addressed by
//! a stable index handle rather than a raw pointer (spec.md §9's
//! "handle-arena" guidance for what would otherwise be a pointer graph).

use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::{AdqError, Result};
use crate::hw::{CoherentRegion, Hardware};
use crate::sync::ShortLock;

/// Opaque handle to a live `DmaBuffer`. Stable for the buffer's lifetime;
/// never reused while the buffer is live (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

/// Who is allowed to see/free a buffer. `Scratch` is the driver-internal
/// buffer excluded from "free all user buffers" sweeps (spec.md §3).
/// `Utility` is a recording engine's `USE_UTILITY_BUFFERS`-flagged buffer
/// (spec.md §9): also excluded, since its point is to outlive the session
/// that first allocated it so a later session can reuse it without paying
/// for another `alloc_coherent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Session(u64),
    Scratch,
    Utility(usize),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        const RESERVED_PAGES = 1 << 0;
        const DRIVER_SCRATCH = 1 << 1;
    }
}

/// A contiguous, physically-addressable host buffer shared with the device
/// (spec.md §3 DmaBuffer).
pub struct DmaBuffer {
    pub handle: BufferHandle,
    pub region: CoherentRegion,
    pub owner: BufferOwner,
    pub user_addr: Option<usize>,
    pub in_flight: bool,
}

impl DmaBuffer {
    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }
}

/// Selection criteria for `DmaBufferTable::free` (spec.md §4.3).
pub enum FreeCriterion {
    ByUserAddr(usize),
    ByHandle(BufferHandle),
    BySession(u64),
    ByUtilitySlot(usize),
    All,
    AllUser,
}

/// Result of a successful address lookup (spec.md §4.3, §8 property 1).
pub struct Lookup {
    pub handle: BufferHandle,
    pub kernel_addr: usize,
    pub bytes_remaining: usize,
}

fn page_round_up(bytes: usize) -> usize {
    const PAGE: usize = 4096;
    let rem = bytes % PAGE;
    if rem == 0 {
        bytes
    } else {
        bytes + (PAGE - rem)
    }
}

pub struct DmaBufferTable {
    hw: Arc<dyn Hardware>,
    buffers: ShortLock<Vec<Option<DmaBuffer>>>,
}

impl DmaBufferTable {
    pub fn new(hw: Arc<dyn Hardware>) -> Self {
        DmaBufferTable {
            hw,
            buffers: ShortLock::new(Vec::new()),
        }
    }

    /// Allocate a coherent region of at least `req_bytes`, rounded up to the
    /// page size, and record a new descriptor for it.
    pub fn allocate(&self, req_bytes: usize, owner: BufferOwner) -> Result<BufferHandle> {
        let rounded = page_round_up(req_bytes.max(1));
        let region = self
            .hw
            .alloc_coherent(rounded)
            .map_err(|_| AdqError::DmaBufAllocFail { requested_bytes: rounded })?;
        let mut buffers = self.buffers.lock();
        let buf = DmaBuffer {
            handle: BufferHandle(0),
            region,
            owner,
            user_addr: None,
            in_flight: false,
        };
        let index = buffers.len();
        let mut buf = buf;
        buf.handle = BufferHandle(index);
        buffers.push(Some(buf));
        Ok(BufferHandle(index))
    }

    /// Map a previously allocated buffer into userspace. In this
    /// transport-agnostic core there is no real address-space boundary to
    /// cross, so the "user address" is simply recorded as equal to the
    /// kernel address — real transports substitute their own `mmap` offset.
    pub fn map_to_userspace(&self, handle: BufferHandle, len: usize) -> Result<usize> {
        let mut buffers = self.buffers.lock();
        let buf = buffers
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(AdqError::InvalidObjectHandle)?;
        if len > buf.len() {
            return Err(AdqError::BufferTooSmall { needed: len, have: buf.len() });
        }
        if buf.user_addr.is_some() {
            return Err(AdqError::InvalidArg("buffer already mapped"));
        }
        let user_addr = buf.region.kernel_addr;
        buf.user_addr = Some(user_addr);
        Ok(user_addr)
    }

    /// Locate the descriptor containing `user_addr`, honoring
    /// `allow_offset` to permit any address within the buffer rather than
    /// only its base (spec.md §4.3, §8 property 1).
    pub fn lookup(&self, user_addr: usize, allow_offset: bool) -> Result<Lookup> {
        let buffers = self.buffers.lock();
        for slot in buffers.iter().flatten() {
            let Some(base) = slot.user_addr else { continue };
            let size = slot.len();
            let matches = if allow_offset {
                user_addr >= base && user_addr < base + size
            } else {
                user_addr == base
            };
            if matches {
                let offset = user_addr - base;
                return Ok(Lookup {
                    handle: slot.handle,
                    kernel_addr: slot.region.kernel_addr + offset,
                    bytes_remaining: size - offset,
                });
            }
        }
        Err(AdqError::InvalidDmaAddr)
    }

    pub fn handle_len(&self, handle: BufferHandle) -> Result<usize> {
        let buffers = self.buffers.lock();
        buffers
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .map(DmaBuffer::len)
            .ok_or(AdqError::InvalidObjectHandle)
    }

    /// A cheap clone of the buffer's `CoherentRegion`, sharing storage, for
    /// handing to `Hardware::kick_dma` without holding the table lock.
    pub fn clone_region(&self, handle: BufferHandle) -> Result<CoherentRegion> {
        let buffers = self.buffers.lock();
        buffers
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .map(|buf| buf.region.clone())
            .ok_or(AdqError::InvalidObjectHandle)
    }

    pub fn region_of(&self, handle: BufferHandle) -> Result<CoherentRegionRef> {
        let buffers = self.buffers.lock();
        let buf = buffers
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(AdqError::InvalidObjectHandle)?;
        Ok(CoherentRegionRef {
            kernel_addr: buf.region.kernel_addr,
            bus_addr: buf.region.bus_addr,
            len: buf.region.len,
        })
    }

    pub fn set_in_flight(&self, handle: BufferHandle, in_flight: bool) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let buf = buffers
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(AdqError::InvalidObjectHandle)?;
        buf.in_flight = in_flight;
        Ok(())
    }

    /// Free descriptors matching `criterion`. Selection happens under the
    /// short lock; the spliced-off descriptors are dropped (and their
    /// coherent regions released) only after the lock is released, since
    /// releasing host memory may sleep (spec.md §4.3).
    pub fn free(&self, criterion: FreeCriterion) -> Result<usize> {
        let mut to_free = Vec::new();
        {
            let mut buffers = self.buffers.lock();
            for slot in buffers.iter_mut() {
                let matches = match slot.as_ref() {
                    Some(buf) if buf.in_flight => false,
                    Some(buf) => match &criterion {
                        FreeCriterion::ByUserAddr(addr) => buf.user_addr == Some(*addr),
                        FreeCriterion::ByHandle(h) => buf.handle == *h,
                        FreeCriterion::BySession(s) => buf.owner == BufferOwner::Session(*s),
                        FreeCriterion::ByUtilitySlot(slot) => buf.owner == BufferOwner::Utility(*slot),
                        FreeCriterion::All => true,
                        FreeCriterion::AllUser => {
                            !matches!(buf.owner, BufferOwner::Scratch | BufferOwner::Utility(_))
                        }
                    },
                    None => false,
                };
                if matches {
                    to_free.push(slot.take().unwrap());
                }
            }
        }
        let count = to_free.len();
        for buf in to_free {
            self.hw.free_coherent(buf.region);
        }
        Ok(count)
    }

    /// `USE_UTILITY_BUFFERS` support (spec.md §9): return the slot's cached
    /// buffer if one of at least `req_bytes` already exists, otherwise
    /// allocate and map a fresh one under `BufferOwner::Utility(slot)`. The
    /// buffer is never freed by `FreeCriterion::AllUser`, so it survives
    /// past the recording session that first requested it.
    pub fn get_or_alloc_utility(&self, slot: usize, req_bytes: usize) -> Result<(BufferHandle, usize)> {
        let existing = {
            let buffers = self.buffers.lock();
            buffers.iter().flatten().find_map(|buf| {
                if buf.owner == BufferOwner::Utility(slot) && buf.len() >= req_bytes {
                    buf.user_addr.map(|addr| (buf.handle, addr))
                } else {
                    None
                }
            })
        };
        if let Some(found) = existing {
            return Ok(found);
        }
        // Wrong size or never allocated: drop whatever is there and start
        // fresh, the same way a resized scratch buffer would be replaced.
        self.free(FreeCriterion::ByUtilitySlot(slot))?;
        let handle = self.allocate(req_bytes, BufferOwner::Utility(slot))?;
        let addr = self.map_to_userspace(handle, req_bytes)?;
        Ok((handle, addr))
    }

    pub fn live_handles(&self) -> Vec<BufferHandle> {
        self.buffers
            .lock()
            .iter()
            .flatten()
            .map(|b| b.handle)
            .collect()
    }
}

/// A cheap, `Copy` view of a `CoherentRegion`'s addressing fields, used by
/// callers that need to issue a DMA without holding the buffer table lock.
#[derive(Debug, Clone, Copy)]
pub struct CoherentRegionRef {
    pub kernel_addr: usize,
    pub bus_addr: u64,
    pub len: usize,
}

pub fn scratch_bytes(cfg: &DeviceConfig) -> usize {
    cfg.bytes_for_samples(cfg.scratch_default_samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SimHardware;

    fn table() -> DmaBufferTable {
        DmaBufferTable::new(Arc::new(SimHardware::new()))
    }

    #[test]
    fn allocate_rounds_up_to_page_size() {
        let t = table();
        let h = t.allocate(100, BufferOwner::Session(1)).unwrap();
        assert_eq!(t.handle_len(h).unwrap(), 4096);
    }

    #[test]
    fn lookup_roundtrip_matches_property_1() {
        let t = table();
        let h = t.allocate(4096 * 4, BufferOwner::Session(1)).unwrap();
        let base = t.map_to_userspace(h, 4096 * 4).unwrap();
        for k in [0usize, 10, 4095, 8192] {
            let found = t.lookup(base + k, true).unwrap();
            assert_eq!(found.kernel_addr, base + k);
            assert_eq!(found.bytes_remaining, 4096 * 4 - k);
        }
    }

    #[test]
    fn lookup_without_offset_requires_exact_base() {
        let t = table();
        let h = t.allocate(4096, BufferOwner::Session(1)).unwrap();
        let base = t.map_to_userspace(h, 4096).unwrap();
        assert!(t.lookup(base + 1, false).is_err());
        assert!(t.lookup(base, false).is_ok());
    }

    #[test]
    fn free_by_session_only_removes_that_sessions_buffers() {
        let t = table();
        let a = t.allocate(4096, BufferOwner::Session(1)).unwrap();
        let b = t.allocate(4096, BufferOwner::Session(2)).unwrap();
        t.free(FreeCriterion::BySession(1)).unwrap();
        let live = t.live_handles();
        assert!(!live.contains(&a));
        assert!(live.contains(&b));
    }

    #[test]
    fn free_all_user_skips_scratch() {
        let t = table();
        let scratch = t.allocate(4096, BufferOwner::Scratch).unwrap();
        let user = t.allocate(4096, BufferOwner::Session(1)).unwrap();
        t.free(FreeCriterion::AllUser).unwrap();
        let live = t.live_handles();
        assert!(live.contains(&scratch));
        assert!(!live.contains(&user));
    }

    #[test]
    fn get_or_alloc_utility_reuses_a_large_enough_buffer() {
        let t = table();
        let (h1, addr1) = t.get_or_alloc_utility(0, 4096).unwrap();
        let (h2, addr2) = t.get_or_alloc_utility(0, 4096).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(addr1, addr2);
        assert_eq!(t.live_handles().len(), 1);
    }

    #[test]
    fn get_or_alloc_utility_reallocates_when_grown() {
        let t = table();
        let (h1, _) = t.get_or_alloc_utility(0, 4096).unwrap();
        let (h2, _) = t.get_or_alloc_utility(0, 4096 * 4).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(t.live_handles().len(), 1);
        assert!(t.handle_len(h2).unwrap() >= 4096 * 4);
    }

    #[test]
    fn get_or_alloc_utility_is_excluded_from_all_user_sweeps() {
        let t = table();
        let (utility, _) = t.get_or_alloc_utility(0, 4096).unwrap();
        let user = t.allocate(4096, BufferOwner::Session(1)).unwrap();
        t.free(FreeCriterion::AllUser).unwrap();
        let live = t.live_handles();
        assert!(live.contains(&utility));
        assert!(!live.contains(&user));
    }

    #[test]
    fn in_flight_buffer_is_not_freed() {
        let t = table();
        let h = t.allocate(4096, BufferOwner::Session(1)).unwrap();
        t.set_in_flight(h, true).unwrap();
        t.free(FreeCriterion::All).unwrap();
        assert!(t.live_handles().contains(&h));
    }
}
