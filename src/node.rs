use crate::sync::{AtomicPtr, Ordering};
use std::ptr::{self, NonNull};

/// An object that has been retired (removed from shared view) but not yet reclaimed.
///
/// The node stores the type-erased pointer to the retired value, the destructor that
/// knows how to drop the concrete type, and a single `next` link. The link belongs to
/// whichever structure currently holds the node: a thread's `RetiredBuffer` while it
/// is buffered, the domain after a batch has been handed over.
///
/// 一个已被退休（从共享视图中移除）但尚未回收的对象。
/// 节点存储已退休值的类型擦除指针、知道如何 drop 具体类型的析构函数，以及一个 `next` 链接。
/// 该链接属于当前持有此节点的结构：缓冲时属于线程的 `RetiredBuffer`，批次移交后属于域。
#[derive(Debug)]
pub struct RetiredNode {
    next: AtomicPtr<RetiredNode>,
    data: *mut (),
    dtor: unsafe fn(*mut ()),
}

/// Converts the raw pointer back to `Box<T>` and drops it.
/// 将原始指针转换回 `Box<T>` 并将其 drop。
#[inline(always)]
unsafe fn drop_value<T>(ptr: *mut ()) {
    unsafe {
        drop(Box::from_raw(ptr as *mut T));
    }
}

impl RetiredNode {
    /// Create a heap-allocated node for a retired value.
    ///
    /// The returned node is owned by the caller until it is handed to a buffer or a
    /// domain, and must eventually be passed to [`RetiredNode::reclaim`].
    ///
    /// 为一个已退休的值创建堆分配的节点。
    #[inline]
    pub fn new<T: Send + 'static>(value: Box<T>) -> NonNull<RetiredNode> {
        let node = Box::new(RetiredNode {
            next: AtomicPtr::new(ptr::null_mut()),
            data: Box::into_raw(value) as *mut (),
            dtor: drop_value::<T>,
        });
        NonNull::from(Box::leak(node))
    }

    /// Address of the retired value, as published by hazard records.
    #[inline]
    pub fn address(&self) -> *mut u8 {
        self.data as *mut u8
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut RetiredNode {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut RetiredNode) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// Free the node and drop the retired value.
    ///
    /// # Safety
    /// `node` must come from [`RetiredNode::new`], must not be linked into any list that
    /// will still be traversed, and no hazard record may protect its address.
    #[inline]
    pub unsafe fn reclaim(node: NonNull<RetiredNode>) {
        let node = unsafe { Box::from_raw(node.as_ptr()) };
        let (data, dtor) = (node.data, node.dtor);
        // the value's destructor may retire more objects; free the node before it runs
        drop(node);
        unsafe { dtor(data) };
    }
}

/// A non-empty batch of retired nodes linked through their `next` links.
///
/// `RetiredList` is the value a thread hands to [`Domain::bulk_retire`](crate::Domain::bulk_retire):
/// the first node, the last node and the number of nodes. The last node's link is null.
/// Whoever holds the list owns the nodes in it; dropping it without handing the nodes
/// on leaks them.
///
/// 通过 `next` 链接串起来的非空已退休节点批次。
/// `RetiredList` 是线程交给 `Domain::bulk_retire` 的值：首节点、尾节点和节点数量。
/// 尾节点的链接为 null。持有列表的一方拥有其中的节点。
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a RetiredList leaks its nodes"]
pub struct RetiredList {
    head: NonNull<RetiredNode>,
    tail: NonNull<RetiredNode>,
    count: usize,
}

// SAFETY: nodes only carry `Send` values (see `RetiredNode::new`) and the list owns them.
unsafe impl Send for RetiredList {}

impl RetiredList {
    /// A batch holding just `node`.
    #[inline]
    pub fn single(node: NonNull<RetiredNode>) -> Self {
        // SAFETY: the caller hands us the node, so we own its link.
        unsafe { node.as_ref() }.set_next(ptr::null_mut());
        Self {
            head: node,
            tail: node,
            count: 1,
        }
    }

    /// # Safety
    /// `head` must reach `tail` through `count - 1` next links, and `tail`'s link must be null.
    #[inline]
    pub(crate) unsafe fn from_raw_parts(
        head: NonNull<RetiredNode>,
        tail: NonNull<RetiredNode>,
        count: usize,
    ) -> Self {
        debug_assert!(count > 0);
        Self { head, tail, count }
    }

    #[inline]
    pub fn head(&self) -> NonNull<RetiredNode> {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> NonNull<RetiredNode> {
        self.tail
    }

    /// Number of nodes in the batch. Never zero.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Splice `other` after this list's tail.
    #[inline]
    pub fn append(&mut self, other: RetiredList) {
        // SAFETY: we own both lists, so we own the tail's link.
        unsafe { self.tail.as_ref() }.set_next(other.head.as_ptr());
        self.tail = other.tail;
        self.count += other.count;
    }
}

impl IntoIterator for RetiredList {
    type Item = NonNull<RetiredNode>;
    type IntoIter = Nodes;

    fn into_iter(self) -> Nodes {
        Nodes {
            next: self.head.as_ptr(),
        }
    }
}

/// Owning iterator over the nodes of a [`RetiredList`].
///
/// Each node's link is read before the node is yielded, so the consumer may reclaim
/// or relink the yielded node right away.
#[derive(Debug)]
pub struct Nodes {
    next: *mut RetiredNode,
}

impl Iterator for Nodes {
    type Item = NonNull<RetiredNode>;

    #[inline]
    fn next(&mut self) -> Option<NonNull<RetiredNode>> {
        let node = NonNull::new(self.next)?;
        // SAFETY: the iterator owns the remaining nodes of the list.
        self.next = unsafe { node.as_ref() }.next();
        Some(node)
    }
}

/// Accumulates nodes into a `RetiredList`, used by domains that split a batch.
#[derive(Debug, Default)]
pub struct ListBuilder {
    list: Option<RetiredList>,
}

impl ListBuilder {
    pub fn new() -> Self {
        Self { list: None }
    }

    pub fn push(&mut self, node: NonNull<RetiredNode>) {
        let single = RetiredList::single(node);
        match &mut self.list {
            Some(list) => list.append(single),
            None => self.list = Some(single),
        }
    }

    pub fn finish(self) -> Option<RetiredList> {
        self.list
    }
}
