use crate::sync::{AtomicBool, AtomicPtr, Ordering};
use std::ptr::{self, NonNull};

/// A hazard record owned by a domain.
///
/// While a record is active, `ptr` publishes the one address its holder is
/// currently reading through. The domain never reclaims a retired object whose
/// address is published by an active record.
///
/// 由域持有的危险记录。
/// 记录处于活跃状态时，`ptr` 发布其持有者当前正在读取的地址。
/// 域永远不会回收地址被活跃记录发布的已退休对象。
#[derive(Debug)]
pub struct HazardRecord {
    ptr: AtomicPtr<u8>,
    active: AtomicBool,
    pub(crate) next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    pub(crate) fn new(active: bool) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(active),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish `ptr` as protected by this record.
    #[inline]
    pub fn protect(&self, ptr: *mut u8) {
        self.ptr.store(ptr, Ordering::Release);
    }

    /// Clear the published address.
    #[inline]
    pub fn reset(&self) {
        self.ptr.store(ptr::null_mut(), Ordering::Release);
    }

    /// The currently published address, or null.
    #[inline]
    pub fn protected(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Claim an inactive record. Returns `false` if someone else holds it.
    #[inline]
    pub fn try_claim(&self) -> bool {
        !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Mark the record inactive, clearing any published address first.
    #[inline]
    pub fn release(&self) {
        self.reset();
        self.active.store(false, Ordering::Release);
    }
}

/// A handle to one hazard record acquired from a domain.
///
/// `GuardRecord` is move-only: exactly one handle exists for every acquired
/// record, so a record can never sit in two cache slots at once, and giving the
/// handle back to the domain consumes it.
///
/// The record itself is owned by the domain and stays valid for as long as the
/// domain that handed it out is alive.
///
/// 从域获取的一个危险记录的句柄。
/// `GuardRecord` 只能移动：每个已获取的记录恰好对应一个句柄，
/// 因此一个记录不可能同时出现在两个缓存槽中，归还句柄会消耗它。
/// 记录本身由域持有，只要分发它的域存活就保持有效。
#[derive(Debug, PartialEq, Eq)]
pub struct GuardRecord {
    record: NonNull<HazardRecord>,
}

// SAFETY: the record is owned by a `Sync` domain and only mutated through atomics.
unsafe impl Send for GuardRecord {}

impl GuardRecord {
    /// Wrap a record the caller has exclusively claimed.
    ///
    /// # Safety
    /// `record` must point to a live, domain-owned record that the caller claimed and for
    /// which no other `GuardRecord` exists. It must stay valid until the handle is released.
    #[inline]
    pub unsafe fn from_raw(record: NonNull<HazardRecord>) -> Self {
        Self { record }
    }

    /// Consume the handle, returning the record pointer.
    #[inline]
    pub fn into_raw(self) -> NonNull<HazardRecord> {
        self.record
    }

    #[inline]
    pub fn as_ptr(&self) -> *const HazardRecord {
        self.record.as_ptr()
    }
}

impl std::ops::Deref for GuardRecord {
    type Target = HazardRecord;

    #[inline]
    fn deref(&self) -> &HazardRecord {
        // SAFETY: the owning domain keeps the record alive while the handle exists.
        unsafe { self.record.as_ref() }
    }
}
