/// 线程本地注册表测试模块
/// 测试惰性构造、按 (类型, 标签) 区分实例、逆序销毁以及线程退出时的销毁

use super::MockDomain;
use crate::{LocalError, Registry, with_instance, with_retired_buffer, with_thread_cache};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

enum TagA {}
enum TagB {}

struct Counter(Cell<usize>);

struct Noisy {
    name: &'static str,
    order: Rc<RefCell<Vec<&'static str>>>,
}

impl Drop for Noisy {
    fn drop(&mut self) {
        self.order.borrow_mut().push(self.name);
    }
}

/// 测试1: 每个 (类型, 标签) 只构造一次
#[test]
fn test_instance_constructed_once_per_key() {
    let registry = Registry::new();
    let constructed = Cell::new(0);

    for _ in 0..3 {
        let counter = registry.get_or_insert_with::<Counter, TagA>(|| {
            constructed.set(constructed.get() + 1);
            Counter(Cell::new(0))
        });
        counter.0.set(counter.0.get() + 1);
    }

    assert_eq!(constructed.get(), 1);
    assert_eq!(registry.len(), 1);
    let counter = registry.get_or_insert_with::<Counter, TagA>(|| unreachable!());
    assert_eq!(counter.0.get(), 3);
}

/// 测试2: 不同标签得到独立实例
#[test]
fn test_tags_give_independent_instances() {
    let registry = Registry::new();
    let a = registry.get_or_insert_with::<Counter, TagA>(|| Counter(Cell::new(1)));
    let b = registry.get_or_insert_with::<Counter, TagB>(|| Counter(Cell::new(2)));

    assert!(!std::ptr::eq(a, b));
    assert_eq!(a.0.get(), 1);
    assert_eq!(b.0.get(), 2);
    assert_eq!(registry.len(), 2);
}

/// 测试3: 销毁按构造的逆序进行
#[test]
fn test_teardown_runs_in_reverse_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new();
    registry.get_or_insert_with::<Noisy, TagA>(|| Noisy {
        name: "first",
        order: order.clone(),
    });
    registry.get_or_insert_with::<Noisy, TagB>(|| Noisy {
        name: "second",
        order: order.clone(),
    });

    registry.teardown();
    assert!(registry.is_empty());
    assert_eq!(*order.borrow(), vec!["second", "first"]);

    drop(registry);
    assert_eq!(order.borrow().len(), 2);
}

/// 测试4: 构造函数中可以访问注册表
#[test]
fn test_init_may_reach_the_registry() {
    let registry = Registry::new();
    let outer = registry.get_or_insert_with::<Counter, TagA>(|| {
        let inner = registry.get_or_insert_with::<Counter, TagB>(|| Counter(Cell::new(7)));
        Counter(Cell::new(inner.0.get() + 1))
    });

    assert_eq!(outer.0.get(), 8);
    assert_eq!(registry.len(), 2);
}

/// 测试5: 线程退出时销毁线程本地实例
#[test]
fn test_instances_dropped_on_thread_exit() {
    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let thread_drops = drops.clone();
    thread::spawn(move || {
        for _ in 0..3 {
            with_instance::<DropCount, TagA, _>(|| DropCount(thread_drops.clone()), |_| ()).unwrap();
        }
        assert_eq!(thread_drops.load(Ordering::SeqCst), 0);
    })
    .join()
    .unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

/// 测试6: 线程本地实例绑定到第一个域
#[test]
fn test_instance_bound_to_first_domain() {
    let first = MockDomain::leak();
    let second = MockDomain::leak();

    thread::spawn(move || {
        assert!(with_thread_cache(first, |cache| cache.count()).is_ok());
        assert_eq!(
            with_thread_cache(second, |cache| cache.count()),
            Err(LocalError::ForeignDomain)
        );

        assert!(with_retired_buffer(second, |buffer| buffer.len()).is_ok());
        assert_eq!(
            with_retired_buffer(first, |buffer| buffer.len()),
            Err(LocalError::ForeignDomain)
        );
    })
    .join()
    .unwrap();
}

/// 测试7: 错误信息
#[test]
fn test_local_error_messages() {
    assert_eq!(
        LocalError::Destroyed.to_string(),
        "thread-local storage is being torn down"
    );
    assert_eq!(
        LocalError::ForeignDomain.to_string(),
        "thread-local instance belongs to another domain"
    );
}
