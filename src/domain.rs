use crate::node::{ListBuilder, RetiredList, RetiredNode};
use crate::record::{GuardRecord, HazardRecord};
use crate::sync::{AtomicPtr, AtomicUsize, Mutex, Ordering, fence};
use std::collections::HashSet;
use std::ptr::{self, NonNull};

/// Default number of retired objects after which `HazptrDomain` scans automatically.
/// 自动扫描的默认已退休对象数量阈值。
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 1000;

/// The global reclamation authority the thread-local layer talks to.
///
/// A domain owns the pool of hazard records and decides when retired objects are safe
/// to destroy. The thread-local layer only ever calls these three entry points, and only
/// on a cache miss, a full cache, a threshold crossing or thread teardown.
///
/// 线程本地层所对接的全局回收权威。
/// 域持有危险记录池，并决定已退休对象何时可以安全销毁。
/// 线程本地层只会调用这三个入口，且只在缓存未命中、缓存已满、越过阈值或线程销毁时调用。
pub trait Domain {
    /// Hand out a free hazard record.
    fn acquire_record(&self) -> GuardRecord;

    /// Return a record to the free pool.
    fn release_record(&self, record: GuardRecord);

    /// Take ownership of a batch of already-linked retired nodes.
    fn bulk_retire(&self, list: RetiredList);
}

/// Builder for configuring a `HazptrDomain`.
///
/// # Example
/// ```
/// use hazptr_tls::HazptrDomain;
///
/// let domain = HazptrDomain::builder()
///     .reclaim_threshold(128)
///     .preallocate(8)
///     .build();
/// assert_eq!(domain.record_count(), 8);
/// ```
///
/// 用于配置 `HazptrDomain` 的构建器。
pub struct HazptrDomainBuilder {
    reclaim_threshold: Option<usize>,
    preallocate: usize,
}

impl HazptrDomainBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            reclaim_threshold: Some(DEFAULT_RECLAIM_THRESHOLD),
            preallocate: 0,
        }
    }

    /// Set the automatic reclamation threshold.
    ///
    /// Once the number of retired objects held by the domain reaches this threshold,
    /// `collect()` runs at the end of `bulk_retire`. Pass `None` to disable it.
    ///
    /// Default: `Some(1000)`
    ///
    /// 设置自动回收阈值。传递 `None` 可禁用自动回收。
    #[inline]
    pub fn reclaim_threshold(mut self, threshold: impl Into<Option<usize>>) -> Self {
        self.reclaim_threshold = threshold.into();
        self
    }

    /// Allocate `count` inactive records up front.
    ///
    /// Default: `0`
    #[inline]
    pub fn preallocate(mut self, count: usize) -> Self {
        self.preallocate = count;
        self
    }

    #[inline]
    pub fn build(self) -> HazptrDomain {
        let domain = HazptrDomain {
            records: AtomicPtr::new(ptr::null_mut()),
            record_count: AtomicUsize::new(0),
            retired: Mutex::new(None),
            retired_count: AtomicUsize::new(0),
            reclaim_threshold: self.reclaim_threshold,
        };
        for _ in 0..self.preallocate {
            domain.link_record(HazardRecord::new(false));
        }
        domain
    }
}

impl Default for HazptrDomainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference hazard-pointer domain.
///
/// Records live in a push-only lock-free list and are recycled through their `active`
/// flag. Retired batches are spliced into one list; `collect()` reclaims every retired
/// object whose address no active record publishes.
///
/// Dropping the domain reclaims everything still retired, so it must outlive every
/// guard, cache and buffer that refers to it. Thread-local instances require a
/// `'static` domain, such as [`HazptrDomain::global`] or a leaked one.
///
/// 一个参考危险指针域。
/// 记录保存在只增的无锁链表中，通过 `active` 标志复用。
/// 已退休批次被拼接到一个列表中；`collect()` 回收所有地址未被活跃记录发布的已退休对象。
#[derive(Debug)]
pub struct HazptrDomain {
    records: AtomicPtr<HazardRecord>,
    record_count: AtomicUsize,
    retired: Mutex<Option<RetiredList>>,
    retired_count: AtomicUsize,
    reclaim_threshold: Option<usize>,
}

impl HazptrDomain {
    /// Create a new domain with default settings.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[inline]
    pub fn builder() -> HazptrDomainBuilder {
        HazptrDomainBuilder::new()
    }

    /// The process-wide default domain.
    ///
    /// 进程级默认域。
    #[cfg(not(feature = "loom"))]
    pub fn global() -> &'static HazptrDomain {
        static GLOBAL: std::sync::OnceLock<HazptrDomain> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(HazptrDomain::new)
    }

    /// Number of records ever allocated by this domain.
    #[inline]
    pub fn record_count(&self) -> usize {
        self.record_count.load(Ordering::Relaxed)
    }

    /// Number of retired objects waiting for reclamation.
    ///
    /// Only updated while the retired list is locked, so it always matches the list.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired_count.load(Ordering::Relaxed)
    }

    fn link_record(&self, record: HazardRecord) -> NonNull<HazardRecord> {
        let record = NonNull::from(Box::leak(Box::new(record)));
        let mut head = self.records.load(Ordering::Acquire);
        loop {
            // SAFETY: the record is not yet shared.
            unsafe { record.as_ref() }.next.store(head, Ordering::Relaxed);
            match self.records.compare_exchange_weak(
                head,
                record.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.record_count.fetch_add(1, Ordering::Relaxed);
        record
    }

    fn records(&self) -> impl Iterator<Item = &HazardRecord> {
        let mut next = self.records.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            // SAFETY: records are never freed before the domain is dropped.
            let record = unsafe { next.as_ref() }?;
            next = record.next.load(Ordering::Acquire);
            Some(record)
        })
    }

    /// Reclaim every retired object not currently protected by a hazard record.
    ///
    /// Destructors run with no lock held and may retire further objects.
    /// Returns the number of objects reclaimed.
    ///
    /// 回收所有当前未被危险记录保护的已退休对象。
    /// 析构函数在不持有锁的情况下运行，并可能退休更多对象。
    /// 返回回收的对象数量。
    pub fn collect(&self) -> usize {
        let taken = {
            let mut retired = self.retired.lock();
            let taken = retired.take();
            if let Some(list) = &taken {
                self.retired_count.fetch_sub(list.count(), Ordering::Relaxed);
            }
            taken
        };
        let Some(list) = taken else {
            return 0;
        };

        // pairs with the fence in `guard::protect_with`
        fence(Ordering::SeqCst);

        let protected: HashSet<*mut u8> = self
            .records()
            .filter(|record| record.is_active())
            .map(HazardRecord::protected)
            .filter(|ptr| !ptr.is_null())
            .collect();

        let mut kept = ListBuilder::new();
        let mut reclaimable = Vec::new();
        for node in list {
            // SAFETY: the domain owns every node in its retired list.
            if protected.contains(&unsafe { node.as_ref() }.address()) {
                kept.push(node);
            } else {
                reclaimable.push(node);
            }
        }

        if let Some(kept) = kept.finish() {
            self.splice(kept);
        }

        let reclaimed = reclaimable.len();
        for node in reclaimable {
            // SAFETY: unlinked, and no active record protects it.
            unsafe { RetiredNode::reclaim(node) };
        }
        log::trace!("hazptr domain reclaimed {reclaimed} objects");
        reclaimed
    }

    fn splice(&self, list: RetiredList) -> usize {
        let added = list.count();
        let mut retired = self.retired.lock();
        match retired.as_mut() {
            Some(existing) => existing.append(list),
            None => *retired = Some(list),
        }
        self.retired_count.fetch_add(added, Ordering::Relaxed) + added
    }
}

impl Default for HazptrDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for HazptrDomain {
    fn acquire_record(&self) -> GuardRecord {
        let record = self
            .records()
            .find(|record| record.try_claim())
            .map(NonNull::from)
            .unwrap_or_else(|| self.link_record(HazardRecord::new(true)));
        // SAFETY: claimed above, or freshly linked as active.
        unsafe { GuardRecord::from_raw(record) }
    }

    fn release_record(&self, record: GuardRecord) {
        record.release();
    }

    fn bulk_retire(&self, list: RetiredList) {
        let total = self.splice(list);
        if let Some(threshold) = self.reclaim_threshold {
            if total >= threshold {
                self.collect();
            }
        }
    }
}

impl Drop for HazptrDomain {
    /// At drop time no guard can be alive any more, so everything retired is reclaimed.
    fn drop(&mut self) {
        // reclaiming may retire more objects into this domain
        loop {
            let taken = self.retired.lock().take();
            let Some(list) = taken else {
                break;
            };
            for node in list {
                // SAFETY: no reader can outlive the domain.
                unsafe { RetiredNode::reclaim(node) };
            }
        }

        let mut next = self.records.load(Ordering::Relaxed);
        while !next.is_null() {
            // SAFETY: records were allocated by `link_record` and are freed exactly once.
            let record = unsafe { Box::from_raw(next) };
            next = record.next.load(Ordering::Relaxed);
        }
    }
}
