use blockpool::multi_pool::MultiPool;

use std::collections::HashSet;

#[test]
fn pattern_integrity_across_classes() {
    let pool = MultiPool::new();

    // Sizes up to 2048 exercise the Class-Table, 2049 the oversized path
    for size in [1_usize, 8, 9, 16, 17, 24, 48, 65, 128, 2048, 2049] {
        let pattern = (size & 0xff) as u8;

        let buffers: Vec<_> = (0..1000)
            .map(|_| {
                let ptr = pool.allocate(size);
                assert!(!ptr.is_null(), "allocation of {} Bytes failed", size);
                unsafe { std::ptr::write_bytes(ptr, pattern, size) };
                ptr
            })
            .collect();

        let addresses: HashSet<usize> = buffers.iter().map(|ptr| *ptr as usize).collect();
        assert_eq!(buffers.len(), addresses.len());

        for ptr in buffers.iter() {
            let bytes = unsafe { std::slice::from_raw_parts(*ptr, size) };
            assert!(bytes.iter().all(|byte| *byte == pattern), "size {}", size);
        }

        for ptr in buffers {
            unsafe { pool.deallocate(ptr, size) };
        }
    }
}

#[test]
fn concurrent_churn() {
    use rand::Rng;

    const SIZES: [usize; 6] = [8, 63, 64, 526, 3000, 5000];

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let ops_per_thread = 100_000 / threads;

    let pool = MultiPool::new();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut live: Vec<(*mut u8, usize)> = Vec::new();

                for _ in 0..ops_per_thread {
                    if live.is_empty() || rng.gen_bool(0.5) {
                        let size = SIZES[rng.gen_range(0..SIZES.len())];
                        let ptr = pool.allocate(size);
                        assert!(!ptr.is_null());

                        unsafe { std::ptr::write_bytes(ptr, 0x5a, size) };
                        live.push((ptr, size));
                    } else {
                        let index = rng.gen_range(0..live.len());
                        let (ptr, size) = live.swap_remove(index);
                        unsafe { pool.deallocate(ptr, size) };
                    }
                }

                // No two simultaneously live Allocations may overlap
                let addresses: HashSet<usize> =
                    live.iter().map(|(ptr, _)| *ptr as usize).collect();
                assert_eq!(live.len(), addresses.len());

                for (ptr, size) in live {
                    unsafe { pool.deallocate(ptr, size) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Everything was freed, so every Class has to be balanced once all the
    // Caches flushed on Thread-Exit
    for stats in pool.stats() {
        assert_eq!(
            stats.allocated, stats.deallocated,
            "Size-Class {} is unbalanced",
            stats.block_size
        );
    }
}

#[test]
fn thread_exit_flush() {
    let pool = MultiPool::new();

    let worker_pool = pool.clone();
    let freed: HashSet<usize> = std::thread::spawn(move || {
        let buffers: Vec<_> = (0..100).map(|_| worker_pool.allocate(200)).collect();
        let addresses = buffers.iter().map(|ptr| *ptr as usize).collect();

        for ptr in buffers {
            unsafe { worker_pool.deallocate(ptr, 200) };
        }

        addresses
        // The Thread-Exit flushes the remaining Cache-Entries
    })
    .join()
    .unwrap();

    // The Worker's Blocks sit on top of the Class's Free-List now, modulo a
    // few Blocks that only ever sat in the Worker's Cache
    let buffers: Vec<_> = (0..100).map(|_| pool.allocate(200)).collect();
    let reused = buffers
        .iter()
        .filter(|ptr| freed.contains(&(**ptr as usize)))
        .count();
    assert!(reused >= 85, "only {} of 100 Blocks were reused", reused);

    for ptr in buffers {
        unsafe { pool.deallocate(ptr, 200) };
    }
}

#[test]
fn create_destroy_typed() {
    struct TestObject {
        value: u64,
        name: String,
    }

    let pool = MultiPool::new();

    let object = pool
        .create(TestObject {
            value: 1578,
            name: "ptr1".to_string(),
        })
        .unwrap();

    unsafe {
        assert_eq!(1578, object.as_ref().value);
        assert_eq!("ptr1", object.as_ref().name);
    }

    unsafe { pool.destroy(object) };
}

#[test]
fn destroy_drops_exactly_once() {
    let marker = std::sync::Arc::new(0_usize);
    let pool = MultiPool::new();

    let object = pool.create(marker.clone()).unwrap();
    assert_eq!(2, std::sync::Arc::strong_count(&marker));

    unsafe { pool.destroy(object) };
    assert_eq!(1, std::sync::Arc::strong_count(&marker));
}

#[test]
fn zero_size_is_rejected() {
    let pool = MultiPool::new();

    assert!(pool.allocate(0).is_null());
}

#[test]
fn stats_balance_at_quiescence() {
    let pool = MultiPool::new();

    let mut live = Vec::new();
    for size in [8_usize, 63, 64, 526] {
        for _ in 0..100 {
            live.push((pool.allocate(size), size));
        }
    }

    let allocated: usize = pool.stats().iter().map(|stats| stats.allocated).sum();
    assert_eq!(400, allocated);

    for (ptr, size) in live {
        unsafe { pool.deallocate(ptr, size) };
    }

    for stats in pool.stats() {
        assert_eq!(stats.allocated, stats.deallocated);
    }

    // Writes nothing unless the embedder installed a Logger
    pool.print_stats();
}
