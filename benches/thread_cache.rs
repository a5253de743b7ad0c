use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hazptr_tls::{Domain, GuardArray, HazardGuard, HazptrDomain};
use std::hint::black_box;
use std::sync::atomic::AtomicPtr;
use std::thread;

fn leak_domain() -> &'static HazptrDomain {
    Box::leak(Box::new(HazptrDomain::builder().preallocate(16).build()))
}

// Benchmark 1: Guard acquire/release through the thread cache vs. the domain
fn bench_guard_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard_acquire_release");

    group.bench_function("cached", |b| {
        let domain = leak_domain();
        b.iter(|| {
            let guard = HazardGuard::new_in(domain);
            black_box(&guard);
        });
    });

    group.bench_function("domain_direct", |b| {
        let domain = leak_domain();
        b.iter(|| {
            let record = domain.acquire_record();
            black_box(&record);
            domain.release_record(record);
        });
    });

    group.finish();
}

// Benchmark 2: Protect a pointer with a fresh guard each time
fn bench_protect(c: &mut Criterion) {
    let domain = leak_domain();
    let shared = AtomicPtr::new(Box::into_raw(Box::new(42u64)));

    c.bench_function("guard_protect", |b| {
        b.iter(|| {
            let mut guard = HazardGuard::new_in(domain);
            black_box(guard.protect(&shared).copied());
        });
    });

    // SAFETY: no guard protects the value any more and it is dropped once.
    drop(unsafe { Box::from_raw(shared.into_inner()) });
}

// Benchmark 3: Guard arrays of different sizes
fn bench_guard_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard_array");
    let domain = leak_domain();

    group.bench_function(BenchmarkId::new("array", 1), |b| {
        b.iter(|| black_box(GuardArray::<1, _>::new_in(domain)));
    });
    group.bench_function(BenchmarkId::new("array", 3), |b| {
        b.iter(|| black_box(GuardArray::<3, _>::new_in(domain)));
    });
    group.bench_function(BenchmarkId::new("array", 6), |b| {
        b.iter(|| black_box(GuardArray::<6, _>::new_in(domain)));
    });

    group.finish();
}

// Benchmark 4: Many threads acquiring guards against one domain
fn bench_concurrent_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_guards");
    group.sample_size(10);

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("cached", num_threads),
            num_threads,
            |b, &num_threads| {
                let domain = leak_domain();
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    let guard = HazardGuard::new_in(domain);
                                    black_box(&guard);
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("domain_direct", num_threads),
            num_threads,
            |b, &num_threads| {
                let domain = leak_domain();
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    let record = domain.acquire_record();
                                    black_box(&record);
                                    domain.release_record(record);
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_guard_acquire_release,
    bench_protect,
    bench_guard_array,
    bench_concurrent_guards
);
criterion_main!(benches);
