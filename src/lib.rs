//! Thread-local acceleration for hazard-pointer memory reclamation.
//!
//! A hazard-pointer domain owns a pool of hazard records and decides when retired
//! objects can be destroyed. Talking to it is a synchronized operation, so this crate
//! keeps two per-thread structures in front of it:
//!
//! - [`GuardCache`]: a fixed-capacity stack of records the thread has already acquired.
//!   Protecting a read takes a record from the cache and gives it back afterwards; the
//!   domain is only involved on a miss or when the cache is full.
//! - [`RetiredBuffer`]: an intrusive list of objects the thread has retired. Objects are
//!   handed to the domain in batches of [`RETIRE_THRESHOLD`], and whatever is left when
//!   the thread exits is flushed.
//!
//! Both are reached through a per-thread registry ([`with_instance`]) that destroys them
//! when the thread exits, so cached records are released and buffered objects flushed
//! without any action from the user.
//!
//! ```
//! use hazptr_tls::{HazardGuard, HazptrDomain};
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! static DOMAIN: std::sync::LazyLock<HazptrDomain> = std::sync::LazyLock::new(HazptrDomain::new);
//!
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(String::from("old"))));
//!
//! let mut guard = HazardGuard::new_in(&*DOMAIN);
//! assert_eq!(guard.protect(&shared).map(String::as_str), Some("old"));
//!
//! let old = shared.swap(Box::into_raw(Box::new(String::from("new"))), Ordering::AcqRel);
//! // SAFETY: `old` is no longer reachable through `shared` and is retired once.
//! unsafe { hazptr_tls::retire_in(&*DOMAIN, old) };
//! ```
//!
//! 危险指针内存回收的线程本地加速层。
//! 危险指针域持有危险记录池，并决定已退休对象何时可以销毁。
//! 与域交互需要同步，因此本 crate 在其前面为每个线程维护两个结构：
//! - `GuardCache`：线程已获取记录的固定容量栈。
//! - `RetiredBuffer`：线程已退休对象的侵入式列表，按批次交给域，线程退出时刷新剩余对象。

mod cache;
mod domain;
mod guard;
mod local;
mod node;
mod record;
mod retired;
mod sync;

pub use cache::{CACHE_CAPACITY, CacheTag, GuardCache, with_thread_cache};
pub use domain::{DEFAULT_RECLAIM_THRESHOLD, Domain, HazptrDomain, HazptrDomainBuilder};
pub use guard::{GuardArray, HazardGuard, retire_in};
pub use local::{LocalError, Registry, with_instance};
pub use node::{ListBuilder, Nodes, RetiredList, RetiredNode};
pub use record::{GuardRecord, HazardRecord};
pub use retired::{RETIRE_THRESHOLD, RetireTag, RetiredBuffer, with_retired_buffer};

#[cfg(not(feature = "loom"))]
pub use guard::retire;

#[cfg(feature = "refill-check")]
pub use cache::monitor::{MAX_REFILLS, REFILL_WINDOW};

#[cfg(test)]
mod tests;
