use crate::domain::Domain;
use crate::local::{self, LocalError};
use crate::record::GuardRecord;
use std::cell::Cell;
use std::ptr;

/// Number of guard records a thread keeps cached.
/// 每个线程缓存的守卫记录数量。
pub const CACHE_CAPACITY: usize = 6;

/// Tag under which each thread's guard cache is registered.
pub enum CacheTag {}

/// A thread's LIFO stack of guard records already acquired from a domain.
///
/// Acquiring and releasing protection through the cache touches no shared state. The
/// domain is only involved on a miss (the caller acquires directly), when the cache is
/// full (the caller releases directly), on `refill`/`drain`, and when the cache is
/// dropped, which releases every cached record.
///
/// **Thread Safety**: `GuardCache` is `!Sync` (due to `Cell`) and is owned by one thread.
///
/// 线程的守卫记录后进先出栈，记录已从域获取。
/// 通过缓存获取和释放保护不会触及任何共享状态。
/// 只有在未命中（调用者直接获取）、缓存已满（调用者直接释放）、`refill`/`drain`
/// 以及缓存被 drop（释放所有缓存的记录）时才涉及域。
/// **线程安全性**：`GuardCache` 是 `!Sync` 的（因为 `Cell`），由单个线程持有。
pub struct GuardCache<'d, D: Domain> {
    domain: &'d D,
    slots: [Cell<Option<GuardRecord>>; CACHE_CAPACITY],
    count: Cell<usize>,
    #[cfg(debug_assertions)]
    local: Cell<bool>,
    #[cfg(feature = "refill-check")]
    monitor: monitor::RefillMonitor,
}

impl<'d, D: Domain> GuardCache<'d, D> {
    pub fn new(domain: &'d D) -> Self {
        Self {
            domain,
            slots: std::array::from_fn(|_| Cell::new(None)),
            count: Cell::new(0),
            #[cfg(debug_assertions)]
            local: Cell::new(false),
            #[cfg(feature = "refill-check")]
            monitor: monitor::RefillMonitor::new(),
        }
    }

    #[inline]
    pub const fn capacity() -> usize {
        CACHE_CAPACITY
    }

    /// Number of cached records.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.get()
    }

    #[inline]
    pub fn domain(&self) -> &'d D {
        self.domain
    }

    /// Whether this cache was handed out for `domain`.
    #[inline]
    pub fn belongs_to(&self, domain: &D) -> bool {
        ptr::eq(self.domain, domain)
    }

    /// Pop the most recently cached record, or `None` if the cache is empty.
    #[inline]
    pub fn try_acquire_cached(&self) -> Option<GuardRecord> {
        let count = self.count.get();
        if count == 0 {
            return None;
        }
        self.count.set(count - 1);
        self.slots[count - 1].take()
    }

    /// Push `record` into the next free slot.
    ///
    /// Hands the record back if the cache is full; the caller then releases it to the
    /// domain itself.
    #[inline]
    pub fn try_release_cached(&self, record: GuardRecord) -> Result<(), GuardRecord> {
        let count = self.count.get();
        if count == CACHE_CAPACITY {
            return Err(record);
        }
        let previous = self.slots[count].replace(Some(record));
        debug_assert!(previous.is_none());
        self.count.set(count + 1);
        Ok(())
    }

    /// Acquire `n` fresh records from the domain and cache them.
    ///
    /// # Panics
    /// If fewer than `n` slots are free. With the `refill-check` feature, also panics when
    /// refills happen pathologically often.
    ///
    /// 从域获取 `n` 个新记录并缓存。
    #[inline(never)]
    pub fn refill(&self, n: usize) {
        let count = self.count.get();
        assert!(
            count + n <= CACHE_CAPACITY,
            "BUG: refilling {n} guard records into a cache holding {count} of {CACHE_CAPACITY}"
        );
        #[cfg(feature = "refill-check")]
        self.monitor.record(std::time::Instant::now());

        log::trace!("guard cache refill: {count} cached, acquiring {n}");
        for _ in 0..n {
            let record = self.domain.acquire_record();
            self.slots[self.count.get()].set(Some(record));
            self.count.set(self.count.get() + 1);
        }
    }

    /// Release the `n` most recently cached records back to the domain.
    ///
    /// # Panics
    /// If fewer than `n` records are cached.
    ///
    /// 将最近缓存的 `n` 个记录释放回域。
    #[inline(never)]
    pub fn drain(&self, n: usize) {
        let count = self.count.get();
        assert!(
            n <= count,
            "BUG: draining {n} guard records from a cache holding {count}"
        );
        if n > 0 {
            log::trace!("guard cache drain: {count} cached, releasing {n}");
        }
        for _ in 0..n {
            if let Some(record) = self.try_acquire_cached() {
                self.domain.release_record(record);
            }
        }
    }

    /// Whether this instance is the calling thread's registered cache.
    #[cfg(debug_assertions)]
    #[inline]
    pub fn is_thread_local(&self) -> bool {
        self.local.get()
    }

    #[cfg(debug_assertions)]
    #[inline]
    pub(crate) fn set_thread_local(&self, local: bool) {
        self.local.set(local);
    }
}

impl<D: Domain> Drop for GuardCache<'_, D> {
    /// Release every cached record so none leaks when the thread exits.
    /// 释放所有缓存的记录，确保线程退出时不会泄漏。
    fn drop(&mut self) {
        let count = self.count.get();
        if count > 0 {
            #[cfg(debug_assertions)]
            log::debug!(
                "guard cache dropped (thread-local: {}), releasing {count} records",
                self.local.get()
            );
            #[cfg(not(debug_assertions))]
            log::debug!("guard cache dropped, releasing {count} records");
        }
        self.drain(count);
    }
}

impl<D: Domain> std::fmt::Debug for GuardCache<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardCache")
            .field("count", &self.count.get())
            .finish()
    }
}

/// Run `f` on the calling thread's guard cache for `domain`.
///
/// The cache is created on first use and dropped, releasing its records, when the thread
/// exits. Fails when the thread is tearing down or its cache belongs to another domain;
/// callers then go to the domain directly.
///
/// 在调用线程针对 `domain` 的守卫缓存上运行 `f`。
pub fn with_thread_cache<D, R>(
    domain: &'static D,
    f: impl FnOnce(&GuardCache<'static, D>) -> R,
) -> Result<R, LocalError>
where
    D: Domain + 'static,
{
    local::with_instance::<GuardCache<'static, D>, CacheTag, _>(
        || {
            let cache = GuardCache::new(domain);
            #[cfg(debug_assertions)]
            cache.set_thread_local(true);
            cache
        },
        |cache| {
            if cache.belongs_to(domain) {
                Ok(f(cache))
            } else {
                Err(LocalError::ForeignDomain)
            }
        },
    )?
}

#[cfg(feature = "refill-check")]
pub(crate) mod monitor {
    use std::cell::Cell;
    use std::time::{Duration, Instant};

    /// More refills than this within `REFILL_WINDOW` is fatal.
    pub const MAX_REFILLS: u16 = 10;
    pub const REFILL_WINDOW: Duration = Duration::from_millis(1);

    /// Detects refill storms, which mean the cache is too small for the caller or the
    /// caller allocates far more guards than it needs.
    #[derive(Debug)]
    pub(crate) struct RefillMonitor {
        refills: Cell<u16>,
        window_start: Cell<Instant>,
    }

    impl RefillMonitor {
        pub(crate) fn new() -> Self {
            Self {
                refills: Cell::new(0),
                window_start: Cell::new(Instant::now()),
            }
        }

        #[cfg(test)]
        pub(crate) fn refills(&self) -> u16 {
            self.refills.get()
        }

        /// Count a refill happening at `now`.
        ///
        /// # Panics
        /// On the refill that exceeds `MAX_REFILLS` within `REFILL_WINDOW` of the window start.
        pub(crate) fn record(&self, now: Instant) {
            let refills = self.refills.get() + 1;
            self.refills.set(refills);
            if refills == 1 {
                self.window_start.set(now);
            } else if refills > MAX_REFILLS {
                let elapsed = now.saturating_duration_since(self.window_start.get());
                if elapsed <= REFILL_WINDOW {
                    log::error!("{refills} guard cache refills within {elapsed:?}");
                    panic!(
                        "[*** INVESTIGATE: Frequent calls to GuardCache::refill may indicate \
                         unnecessary overhead either due to insufficient thread cache capacity, \
                         or due to unnecessary allocation of extra hazard pointers \
                         triggered by user code. ***]"
                    );
                }
                self.refills.set(1);
                self.window_start.set(now);
            }
        }
    }
}
