use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use rand::Rng;
use shared_handle::{Shared, Weak};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A shared `u64` whose release action counts how often it ran and records how many handle
/// drops it could see at that moment.
struct Probe {
    released: Arc<AtomicUsize>,
    drops_seen: Arc<AtomicUsize>,
}

impl Probe {
    fn new() -> Self {
        Probe {
            released: Arc::new(AtomicUsize::new(0)),
            drops_seen: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    fn share(&self, value: u64, drops: &Arc<AtomicUsize>) -> Shared<u64> {
        let released = Arc::clone(&self.released);
        let drops_seen = Arc::clone(&self.drops_seen);
        let drops = Arc::clone(drops);

        unsafe {
            Shared::from_raw(Box::into_raw(Box::new(value)), move |p: *mut u64| {
                drop(Box::from_raw(p));
                drops_seen.store(drops.load(Ordering::Relaxed), Ordering::Relaxed);
                released.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[test]
fn copies_on_many_threads_release_once() {
    init_logger();
    let probe = Probe::new();
    let drops = Arc::new(AtomicUsize::new(0));
    let original = probe.share(42, &drops);

    crossbeam::scope(|s| {
        for _ in 0..8 {
            s.spawn(|_| {
                for _ in 0..10_000 {
                    let copy = original.clone();
                    assert_eq!(*copy, 42);
                    drop(copy);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(original.use_count(), 1);
    assert_eq!(probe.released(), 0);

    drop(original);
    assert_eq!(probe.released(), 1);
}

#[test]
fn release_happens_after_every_owner_is_gone() {
    init_logger();
    const OWNERS: usize = 16;

    for _ in 0..50 {
        let probe = Probe::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let original = probe.share(7, &drops);
        let copies: Vec<_> = (0..OWNERS).map(|_| original.clone()).collect();
        drop(original);

        let barrier = Barrier::new(OWNERS);
        crossbeam::scope(|s| {
            for copy in copies {
                let barrier = &barrier;
                let drops = &drops;
                s.spawn(move |_| {
                    barrier.wait();
                    let spins = rand::thread_rng().gen_range(0..64);
                    for _ in 0..spins {
                        std::hint::spin_loop();
                    }
                    // Relaxed on purpose: the handle drop itself must carry this write to the
                    // releasing thread.
                    drops.fetch_add(1, Ordering::Relaxed);
                    drop(copy);
                });
            }
        })
        .unwrap();

        assert_eq!(probe.released(), 1);
        assert_eq!(probe.drops_seen.load(Ordering::SeqCst), OWNERS);
    }
}

#[test]
fn lock_after_release_is_empty() {
    init_logger();
    let probe = Probe::new();
    let drops = Arc::new(AtomicUsize::new(0));
    let owner = probe.share(1, &drops);
    let weak = Weak::from(&owner);

    drop(owner);
    assert_eq!(probe.released(), 1);

    let promoted = weak.lock();
    assert!(promoted.is_null());
    assert!(promoted.get().is_none());
    assert!(weak.expired());
}

#[test]
fn lock_while_alive_shares_the_resource() {
    init_logger();
    let owner = Shared::new(String::from("resource"));
    let weak = owner.downgrade();

    let promoted = weak.lock();
    assert!(Shared::ptr_eq(&promoted, &owner));
    assert_eq!(&*promoted, "resource");
    assert_eq!(owner.use_count(), 2);

    drop(promoted);
    assert_eq!(owner.use_count(), 1);
}

#[test]
fn lock_racing_the_last_drop_never_resurrects() {
    init_logger();

    for _ in 0..500 {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let owner = unsafe {
            Shared::from_raw(Box::into_raw(Box::new(99u32)), move |p: *mut u32| {
                drop(Box::from_raw(p));
                flag.store(true, Ordering::SeqCst);
            })
        };
        let weak = owner.downgrade();
        let barrier = Barrier::new(2);

        crossbeam::scope(|s| {
            s.spawn(|_| {
                barrier.wait();
                drop(owner);
            });

            s.spawn(|_| {
                barrier.wait();
                loop {
                    let promoted = weak.lock();
                    match promoted.get() {
                        Some(value) => {
                            assert_eq!(*value, 99);
                            assert!(!released.load(Ordering::SeqCst));
                        }
                        None => break,
                    }
                }
            });
        })
        .unwrap();

        assert!(released.load(Ordering::SeqCst));
        assert!(weak.expired());
        assert!(weak.lock().is_null());
    }
}

#[test]
fn promoted_owners_release_exactly_once() {
    init_logger();
    let probe = Probe::new();
    let drops = Arc::new(AtomicUsize::new(0));
    let owner = probe.share(5, &drops);
    let weak = owner.downgrade();

    crossbeam::scope(|s| {
        for _ in 0..4 {
            let weak = weak.clone();
            s.spawn(move |_| {
                let mut rng = rand::thread_rng();
                for _ in 0..2_000 {
                    let promoted = weak.lock();
                    if rng.gen_bool(0.5) {
                        let _again = promoted.clone();
                    }
                }
            });
        }

        s.spawn(|_| drop(owner));
    })
    .unwrap();

    assert_eq!(probe.released(), 1);
    assert!(weak.expired());
}

#[test]
fn weak_handles_dropped_concurrently_after_release() {
    init_logger();

    for _ in 0..100 {
        let probe = Probe::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let owner = probe.share(3, &drops);
        let observers: Vec<Weak<u64>> = (0..8).map(|_| owner.downgrade()).collect();
        let barrier = Barrier::new(observers.len() + 1);

        crossbeam::scope(|s| {
            for observer in observers {
                let barrier = &barrier;
                s.spawn(move |_| {
                    barrier.wait();
                    assert!(observer.lock().get().map_or(true, |v| *v == 3));
                    drop(observer);
                });
            }

            s.spawn(|_| {
                barrier.wait();
                drop(owner);
            });
        })
        .unwrap();

        assert_eq!(probe.released(), 1);
    }
}

#[test]
fn use_count_is_exact_without_concurrent_changes() {
    init_logger();
    let owner = Shared::new(0u8);

    for k in 1..10 {
        let copies: Vec<_> = (1..k).map(|_| owner.clone()).collect();
        assert_eq!(owner.use_count(), k);
        assert_eq!(Weak::from(&owner).use_count(), k);
        drop(copies);
    }
}
