/// 测试模块
/// 共享的测试工具：记录所有调用的模拟域，以及在 drop 时记录自身编号的负载

mod local_tests;

use crate::{Domain, GuardRecord, HazardRecord, RetiredList, RetiredNode};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Hook = Box<dyn FnMut(usize) + Send>;

/// A domain that records every call made to it.
///
/// Records are recycled through a free list so that handing the same record out twice
/// is detectable. Batches are checked against their declared count and reclaimed on the
/// spot, which runs the retired values' destructors inside `bulk_retire`.
#[derive(Default)]
pub(crate) struct MockDomain {
    all: Mutex<Vec<usize>>,
    free: Mutex<Vec<usize>>,
    live: Mutex<HashSet<usize>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    hook: Mutex<Option<Hook>>,
}

impl MockDomain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A domain that outlives every thread, for thread-local instances.
    pub(crate) fn leak() -> &'static MockDomain {
        Box::leak(Box::new(MockDomain::new()))
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub(crate) fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    /// Called with the batch size after every `bulk_retire`.
    pub(crate) fn set_hook(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Domain for MockDomain {
    fn acquire_record(&self) -> GuardRecord {
        let recycled = self.free.lock().unwrap().pop();
        let addr = recycled.unwrap_or_else(|| {
            let record = Box::leak(Box::new(HazardRecord::new(true))) as *mut HazardRecord;
            self.all.lock().unwrap().push(record as usize);
            record as usize
        });
        assert!(
            self.live.lock().unwrap().insert(addr),
            "record handed out while still acquired"
        );
        self.acquired.fetch_add(1, Ordering::SeqCst);
        unsafe { GuardRecord::from_raw(NonNull::new(addr as *mut HazardRecord).unwrap()) }
    }

    fn release_record(&self, record: GuardRecord) {
        let addr = record.into_raw().as_ptr() as usize;
        assert!(
            self.live.lock().unwrap().remove(&addr),
            "released a record that was not acquired"
        );
        self.free.lock().unwrap().push(addr);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn bulk_retire(&self, list: RetiredList) {
        let count = list.count();
        let tail = list.tail();
        let nodes: Vec<_> = list.into_iter().collect();
        assert_eq!(nodes.len(), count, "batch count does not match its list");
        assert_eq!(nodes.last(), Some(&tail));
        self.batches.lock().unwrap().push(count);

        for node in nodes {
            unsafe { RetiredNode::reclaim(node) };
        }

        let hook = self.hook.lock().unwrap().take();
        if let Some(mut hook) = hook {
            hook(count);
            let mut slot = self.hook.lock().unwrap();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

impl Drop for MockDomain {
    fn drop(&mut self) {
        for addr in self.all.lock().unwrap().drain(..) {
            drop(unsafe { Box::from_raw(addr as *mut HazardRecord) });
        }
    }
}

/// Log of dropped payload ids.
pub(crate) type DropLog = Arc<Mutex<Vec<usize>>>;

pub(crate) fn drop_log() -> DropLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn sorted(log: &DropLog) -> Vec<usize> {
    let mut ids = log.lock().unwrap().clone();
    ids.sort_unstable();
    ids
}

/// A retired payload that records its id when dropped.
pub(crate) struct Tracked {
    id: usize,
    log: DropLog,
}

impl Tracked {
    pub(crate) fn new(id: usize, log: &DropLog) -> Self {
        Self {
            id,
            log: log.clone(),
        }
    }

    pub(crate) fn node(id: usize, log: &DropLog) -> NonNull<RetiredNode> {
        RetiredNode::new(Box::new(Tracked::new(id, log)))
    }

    pub(crate) fn raw(id: usize, log: &DropLog) -> *mut Tracked {
        Box::into_raw(Box::new(Tracked::new(id, log)))
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(self.id);
    }
}

/// A retired payload whose destructor retires another object into `domain`.
pub(crate) struct RetiresOnDrop {
    pub(crate) domain: &'static MockDomain,
    pub(crate) inner: Option<Box<Tracked>>,
}

impl Drop for RetiresOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            unsafe { crate::retire_in(self.domain, Box::into_raw(inner)) };
        }
    }
}
