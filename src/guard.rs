use crate::cache::{CACHE_CAPACITY, with_thread_cache};
use crate::domain::{Domain, HazptrDomain};
use crate::node::{RetiredList, RetiredNode};
use crate::record::GuardRecord;
use crate::retired::with_retired_buffer;
use crate::sync::{AtomicPtr, Ordering, fence};

/// Take a record from the thread cache, or from the domain on a miss.
fn acquire<D: Domain + 'static>(domain: &'static D) -> GuardRecord {
    with_thread_cache(domain, |cache| cache.try_acquire_cached())
        .ok()
        .flatten()
        .unwrap_or_else(|| domain.acquire_record())
}

/// Give a record back to the thread cache, or to the domain when the cache is full
/// or unavailable.
fn release<D: Domain + 'static>(domain: &'static D, record: GuardRecord) {
    record.reset();
    let mut record = Some(record);
    let _ = with_thread_cache(domain, |cache| {
        if let Some(rejected) = record.take().and_then(|r| cache.try_release_cached(r).err()) {
            record = Some(rejected);
        }
    });
    if let Some(record) = record {
        domain.release_record(record);
    }
}

/// Publish the pointer loaded from `src` in `record` until a re-read agrees with it.
fn protect_with<T>(record: &GuardRecord, src: &AtomicPtr<T>) -> *mut T {
    let mut ptr = src.load(Ordering::Relaxed);
    loop {
        record.protect(ptr as *mut u8);
        // pairs with the fence in `HazptrDomain::collect`
        fence(Ordering::SeqCst);
        let current = src.load(Ordering::Acquire);
        if current == ptr {
            return ptr;
        }
        ptr = current;
    }
}

/// A single hazard pointer.
///
/// While the guard protects an address, the domain will not reclaim the object at that
/// address. The guard's record comes from the thread's guard cache when possible and goes
/// back there on drop.
///
/// **Typical Usage**:
/// ```
/// use hazptr_tls::HazardGuard;
/// use std::sync::atomic::AtomicPtr;
///
/// let shared = AtomicPtr::new(Box::into_raw(Box::new(42i32)));
///
/// let mut guard = HazardGuard::new();
/// let value = guard.protect(&shared).unwrap();
/// assert_eq!(*value, 42);
/// drop(guard);
///
/// // SAFETY: the pointer is no longer shared and is retired exactly once.
/// unsafe { hazptr_tls::retire(shared.load(std::sync::atomic::Ordering::Acquire)) };
/// ```
///
/// 一个危险指针。
/// 当守卫保护某个地址时，域不会回收该地址上的对象。
/// 守卫的记录尽可能来自线程的守卫缓存，并在 drop 时归还。
pub struct HazardGuard<D: Domain + 'static = HazptrDomain> {
    record: Option<GuardRecord>,
    domain: &'static D,
}

impl HazardGuard<HazptrDomain> {
    /// A guard on the global domain.
    #[cfg(not(feature = "loom"))]
    pub fn new() -> Self {
        Self::new_in(HazptrDomain::global())
    }
}

#[cfg(not(feature = "loom"))]
impl Default for HazardGuard<HazptrDomain> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Domain + 'static> HazardGuard<D> {
    pub fn new_in(domain: &'static D) -> Self {
        Self {
            record: Some(acquire(domain)),
            domain,
        }
    }

    fn record(&self) -> &GuardRecord {
        match &self.record {
            Some(record) => record,
            None => unreachable!("BUG: HazardGuard used after release"),
        }
    }

    /// Protect the object `src` points to and return a reference to it.
    ///
    /// Publishes the loaded pointer and re-reads `src` until the two agree, so the
    /// returned object cannot be reclaimed until this guard is reset or dropped.
    /// Returns `None` if `src` is null.
    ///
    /// 保护 `src` 指向的对象并返回其引用。
    pub fn protect<'g, T>(&'g mut self, src: &AtomicPtr<T>) -> Option<&'g T> {
        let ptr = protect_with(self.record(), src);
        // SAFETY: the address is published and was still current afterwards, so the
        // object was not retired before protection became visible.
        unsafe { ptr.as_ref() }
    }

    /// Stop protecting whatever this guard protects.
    #[inline]
    pub fn reset(&mut self) {
        self.record().reset();
    }
}

impl<D: Domain + 'static> Drop for HazardGuard<D> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            release(self.domain, record);
        }
    }
}

/// `N` hazard pointers taken from the thread cache in one go.
///
/// If the cache holds fewer than `N` records it is refilled first, so acquiring the
/// array costs at most one round of domain acquisitions. `N` may not exceed
/// `CACHE_CAPACITY`.
///
/// 一次从线程缓存取出的 `N` 个危险指针。
/// 如果缓存中的记录少于 `N` 个，会先补充缓存。`N` 不能超过 `CACHE_CAPACITY`。
pub struct GuardArray<const N: usize, D: Domain + 'static = HazptrDomain> {
    guards: [Option<GuardRecord>; N],
    domain: &'static D,
}

impl<const N: usize> GuardArray<N, HazptrDomain> {
    #[cfg(not(feature = "loom"))]
    pub fn new() -> Self {
        Self::new_in(HazptrDomain::global())
    }
}

#[cfg(not(feature = "loom"))]
impl<const N: usize> Default for GuardArray<N, HazptrDomain> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, D: Domain + 'static> GuardArray<N, D> {
    pub fn new_in(domain: &'static D) -> Self {
        const { assert!(N <= CACHE_CAPACITY, "GuardArray is larger than the guard cache") };
        let mut guards: [Option<GuardRecord>; N] = std::array::from_fn(|_| None);
        let cached = with_thread_cache(domain, |cache| {
            if cache.count() < N {
                cache.refill(N - cache.count());
            }
            for guard in guards.iter_mut() {
                *guard = cache.try_acquire_cached();
            }
        });
        if cached.is_err() {
            for guard in guards.iter_mut() {
                *guard = Some(domain.acquire_record());
            }
        }
        Self { guards, domain }
    }

    /// Protect `src` with the `index`-th hazard pointer.
    ///
    /// # Panics
    /// If `index >= N`.
    pub fn protect<'g, T>(&'g mut self, index: usize, src: &AtomicPtr<T>) -> Option<&'g T> {
        let Some(record) = self.guards[index].as_ref() else {
            unreachable!("BUG: GuardArray slot {index} is empty");
        };
        let ptr = protect_with(record, src);
        // SAFETY: see `HazardGuard::protect`.
        unsafe { ptr.as_ref() }
    }

    pub fn reset(&mut self, index: usize) {
        if let Some(record) = &self.guards[index] {
            record.reset();
        }
    }
}

impl<const N: usize, D: Domain + 'static> Drop for GuardArray<N, D> {
    fn drop(&mut self) {
        let domain = self.domain;
        let guards = &mut self.guards;
        let cached = with_thread_cache(domain, |cache| {
            let overflow = (cache.count() + N).saturating_sub(CACHE_CAPACITY);
            if overflow > 0 {
                cache.drain(overflow);
            }
            for record in guards.iter_mut().rev().filter_map(Option::take) {
                record.reset();
                if let Err(record) = cache.try_release_cached(record) {
                    domain.release_record(record);
                }
            }
        });
        if cached.is_err() {
            for record in self.guards.iter_mut().filter_map(Option::take) {
                record.reset();
                domain.release_record(record);
            }
        }
    }
}

/// Retire `ptr` into `domain` through the calling thread's retired buffer.
///
/// Falls back to handing the object to the domain directly when the thread's buffer is
/// unavailable, e.g. during thread teardown.
///
/// # Safety
/// `ptr` must come from `Box::into_raw`, must no longer be reachable by new readers, and
/// must be retired exactly once.
///
/// 通过调用线程的退休缓冲区将 `ptr` 退休到 `domain`。
pub unsafe fn retire_in<T, D>(domain: &'static D, ptr: *mut T)
where
    T: Send + 'static,
    D: Domain + 'static,
{
    // SAFETY: guaranteed by the caller.
    let node = RetiredNode::new(unsafe { Box::from_raw(ptr) });
    if with_retired_buffer(domain, |buffer| buffer.push(node)).is_err() {
        domain.bulk_retire(RetiredList::single(node));
    }
}

/// Retire `ptr` into the global domain.
///
/// # Safety
/// See [`retire_in`].
#[cfg(not(feature = "loom"))]
pub unsafe fn retire<T: Send + 'static>(ptr: *mut T) {
    unsafe { retire_in(HazptrDomain::global(), ptr) }
}
