use crate::domain::Domain;
use crate::local::{self, LocalError};
use crate::node::{RetiredList, RetiredNode};
use crate::sync::{AtomicPtr, Ordering};
use std::cell::Cell;
use std::ptr::{self, NonNull};

/// Number of buffered retired objects that triggers a hand-off to the domain.
/// 触发向域移交的已缓冲退休对象数量。
pub const RETIRE_THRESHOLD: usize = 20;

/// Tag under which each thread's retired buffer is registered.
pub enum RetireTag {}

/// A thread's intrusive list of retired objects, handed to the domain in bulk.
///
/// Nodes are threaded together through their own `next` links, so buffering never
/// allocates. Once `RETIRE_THRESHOLD` nodes are buffered, or the buffer is dropped, the
/// whole list goes to [`Domain::bulk_retire`] as one batch.
///
/// Insertion does not assume exclusive access to `head`/`tail`: a retirement can start
/// while another retirement or a flush is still in progress on the same thread, e.g.
/// when reclaiming one object runs a destructor that retires another. After the buffer
/// starts tearing down it no longer buffers; every push goes straight to the domain.
///
/// **Thread Safety**: `RetiredBuffer` is `!Sync` (due to `Cell`) and is owned by one thread.
///
/// 线程的侵入式已退休对象列表，批量移交给域。
/// 节点通过自身的 `next` 链接串在一起，因此缓冲从不分配内存。
/// 一旦缓冲了 `RETIRE_THRESHOLD` 个节点，或缓冲区被 drop，整个列表作为一个批次交给域。
/// 插入不假设对 `head`/`tail` 的独占访问：同一线程上的另一个退休或刷新仍在进行时，
/// 也可以开始新的退休（例如回收一个对象时运行的析构函数又退休了另一个对象）。
/// 缓冲区开始销毁后不再缓冲；每次推入都直接交给域。
/// **线程安全性**：`RetiredBuffer` 是 `!Sync` 的（因为 `Cell`），由单个线程持有。
pub struct RetiredBuffer<'d, D: Domain> {
    domain: &'d D,
    head: AtomicPtr<RetiredNode>,
    tail: AtomicPtr<RetiredNode>,
    count: Cell<usize>,
    torn_down: Cell<bool>,
}

impl<'d, D: Domain> RetiredBuffer<'d, D> {
    pub fn new(domain: &'d D) -> Self {
        Self {
            domain,
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            count: Cell::new(0),
            torn_down: Cell::new(false),
        }
    }

    /// Number of buffered nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head().is_null()
    }

    #[inline]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    #[inline]
    pub fn belongs_to(&self, domain: &D) -> bool {
        ptr::eq(self.domain, domain)
    }

    /// Buffer a retired node, flushing once `RETIRE_THRESHOLD` nodes have accumulated.
    ///
    /// After teardown has begun, the node is handed to the domain on its own instead.
    ///
    /// 缓冲一个已退休节点，累积到 `RETIRE_THRESHOLD` 个节点时刷新。
    /// 销毁开始后，节点会被单独交给域。
    pub fn push(&self, node: NonNull<RetiredNode>) {
        if self.torn_down.get() {
            self.domain.bulk_retire(RetiredList::single(node));
            return;
        }

        loop {
            let pushed = if self.tail().is_null() {
                self.push_in_empty_list(node)
            } else {
                self.push_in_non_empty_list(node)
            };
            if pushed {
                break;
            }
        }

        let count = self.count.get() + 1;
        self.count.set(count);
        if count >= RETIRE_THRESHOLD {
            self.flush();
        }
    }

    /// Hand every buffered node to the domain as one batch.
    ///
    /// The list is detached before the domain sees it, so anything retired while the
    /// domain processes the batch starts a fresh list.
    ///
    /// 将所有已缓冲节点作为一个批次交给域。
    pub fn flush(&self) {
        if let Some(list) = self.collect() {
            log::trace!("retired buffer flushing {} nodes", list.count());
            self.domain.bulk_retire(list);
        }
    }

    /// Detach the whole list, leaving the buffer empty.
    fn collect(&self) -> Option<RetiredList> {
        let head = NonNull::new(self.exchange_head())?;
        // the tail is published before the head, so it is set whenever the head is
        let Some(tail) = NonNull::new(self.exchange_tail()) else {
            unreachable!("BUG: retired buffer has a head but no tail");
        };
        // only this thread touches the count, and nothing runs between the exchanges
        let count = self.count.replace(0);
        // SAFETY: head reaches tail through the links set up by `push`, and the tail's
        // link was cleared when it went into the empty list.
        Some(unsafe { RetiredList::from_raw_parts(head, tail, count) })
    }

    #[cfg(test)]
    pub(crate) fn ends(&self) -> (*mut RetiredNode, *mut RetiredNode) {
        (self.head(), self.tail())
    }

    /// Stop buffering; every later push goes straight to the domain.
    pub(crate) fn begin_teardown(&self) {
        self.torn_down.set(true);
    }

    #[inline]
    fn head(&self) -> *mut RetiredNode {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    fn tail(&self) -> *mut RetiredNode {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    fn set_head(&self, node: *mut RetiredNode) {
        self.head.store(node, Ordering::Release);
    }

    #[inline]
    fn cas_head(&self, expected: *mut RetiredNode, node: *mut RetiredNode) -> bool {
        self.head
            .compare_exchange_weak(expected, node, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn cas_tail(&self, expected: *mut RetiredNode, node: *mut RetiredNode) -> bool {
        self.tail
            .compare_exchange_weak(expected, node, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn exchange_head(&self) -> *mut RetiredNode {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    #[inline]
    fn exchange_tail(&self) -> *mut RetiredNode {
        self.tail.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    fn push_in_non_empty_list(&self, node: NonNull<RetiredNode>) -> bool {
        let head = self.head();
        if head.is_null() {
            return false;
        }
        // SAFETY: the caller handed the node over, so its link is ours.
        unsafe { node.as_ref() }.set_next(head);
        self.cas_head(head, node.as_ptr())
    }

    fn push_in_empty_list(&self, node: NonNull<RetiredNode>) -> bool {
        // SAFETY: as above.
        unsafe { node.as_ref() }.set_next(ptr::null_mut());
        // publish the tail first so a visible head always has a tail
        if self.cas_tail(ptr::null_mut(), node.as_ptr()) {
            self.set_head(node.as_ptr());
            true
        } else {
            false
        }
    }
}

impl<D: Domain> Drop for RetiredBuffer<'_, D> {
    /// Flush whatever is still buffered so no retired object is lost at thread exit.
    /// 刷新仍在缓冲中的所有对象，确保线程退出时不会丢失任何已退休对象。
    fn drop(&mut self) {
        self.begin_teardown();
        if !self.is_empty() {
            log::debug!("retired buffer dropped with {} nodes", self.len());
            self.flush();
        }
    }
}

impl<D: Domain> std::fmt::Debug for RetiredBuffer<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetiredBuffer")
            .field("count", &self.count.get())
            .field("torn_down", &self.torn_down.get())
            .finish()
    }
}

/// Run `f` on the calling thread's retired buffer for `domain`.
///
/// The buffer is created on first use and flushed when the thread exits. Fails when the
/// thread is tearing down or its buffer belongs to another domain.
///
/// 在调用线程针对 `domain` 的退休缓冲区上运行 `f`。
pub fn with_retired_buffer<D, R>(
    domain: &'static D,
    f: impl FnOnce(&RetiredBuffer<'static, D>) -> R,
) -> Result<R, LocalError>
where
    D: Domain + 'static,
{
    local::with_instance::<RetiredBuffer<'static, D>, RetireTag, _>(
        || RetiredBuffer::new(domain),
        |buffer| {
            if buffer.belongs_to(domain) {
                Ok(f(buffer))
            } else {
                Err(LocalError::ForeignDomain)
            }
        },
    )?
}
