use std::any::{Any, TypeId};
use std::cell::RefCell;
use thiserror::Error;

/// Why a thread-local instance could not be reached.
///
/// Both cases are ordinary: the caller falls back to talking to the domain directly.
///
/// 无法访问线程本地实例的原因。
/// 两种情况都是正常的：调用者会回退为直接与域交互。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalError {
    /// The calling thread's registry is being, or has been, destroyed.
    #[error("thread-local storage is being torn down")]
    Destroyed,
    /// The thread's instance was created for a different domain.
    #[error("thread-local instance belongs to another domain")]
    ForeignDomain,
}

struct Entry {
    key: (TypeId, TypeId),
    value: Box<dyn Any>,
}

/// A per-thread set of lazily constructed instances, one per `(type, tag)` pair.
///
/// Instances are boxed and never moved or removed until the registry is torn down,
/// which destroys them in reverse construction order. No internal borrow is held while
/// an instance is constructed or destroyed, so constructors and destructors may reach
/// the registry again.
///
/// 每线程的惰性构造实例集合，每个 `(类型, 标签)` 对一个实例。
/// 实例被装箱，在注册表销毁前不会被移动或移除；销毁时按构造的逆序进行。
/// 构造或销毁实例时不持有内部借用，因此构造函数和析构函数可以再次访问注册表。
#[derive(Default)]
pub struct Registry {
    entries: RefCell<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<T: 'static>(&self, key: (TypeId, TypeId)) -> Option<*const T> {
        self.entries
            .borrow()
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .map(|value| value as *const T)
    }

    /// Return the instance for `(T, Tag)`, constructing it with `init` on first use.
    pub fn get_or_insert_with<T: 'static, Tag: 'static>(&self, init: impl FnOnce() -> T) -> &T {
        let key = (TypeId::of::<T>(), TypeId::of::<Tag>());
        if let Some(value) = self.lookup::<T>(key) {
            // SAFETY: boxed instances stay put until `teardown`, which needs `&mut self`.
            return unsafe { &*value };
        }

        let value: Box<dyn Any> = Box::new(init());
        // `init` may have reached the registry and created the instance itself
        if let Some(existing) = self.lookup::<T>(key) {
            drop(value);
            // SAFETY: as above.
            return unsafe { &*existing };
        }

        let ptr = match value.downcast_ref::<T>() {
            Some(value) => value as *const T,
            None => unreachable!("BUG: registry entry has the wrong type"),
        };
        self.entries.borrow_mut().push(Entry { key, value });
        // SAFETY: the box was just moved into the registry; its contents did not move.
        unsafe { &*ptr }
    }

    /// Destroy every instance, newest first.
    pub fn teardown(&mut self) {
        loop {
            let entry = self.entries.borrow_mut().pop();
            match entry {
                Some(entry) => drop(entry),
                None => break,
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

thread_local! {
    static REGISTRY: Registry = Registry::new();
}

/// Run `f` on the calling thread's instance of `T` under `Tag`.
///
/// The instance is constructed with `init` on first use and destroyed when the
/// thread exits. Returns `LocalError::Destroyed` once the thread's registry has started
/// its own destruction.
///
/// 在调用线程的 `(T, Tag)` 实例上运行 `f`。
/// 实例在首次使用时用 `init` 构造，并在线程退出时销毁。
pub fn with_instance<T: 'static, Tag: 'static, R>(
    init: impl FnOnce() -> T,
    f: impl FnOnce(&T) -> R,
) -> Result<R, LocalError> {
    REGISTRY
        .try_with(|registry| f(registry.get_or_insert_with::<T, Tag>(init)))
        .map_err(|_| LocalError::Destroyed)
}
