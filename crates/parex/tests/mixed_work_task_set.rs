//! Scenario 1 from spec.md §8: 10,000 tasks each writing to two
//! independent output slots, verified after `wait()`.

use std::sync::{Arc, Mutex};

use parex::{TaskSet, ThreadPool};

#[test]
fn writes_every_slot_exactly_once() {
    const N: usize = 10_000;
    let pool = ThreadPool::new(8).unwrap();
    let a = Arc::new(Mutex::new(vec![0u64; N]));
    let b = Arc::new(Mutex::new(vec![0u64; N]));

    {
        let task_set = TaskSet::new(&pool);
        for i in 0..N {
            let a = a.clone();
            let b = b.clone();
            task_set.schedule(move || {
                a.lock().unwrap()[i] = (i * i) as u64;
                b.lock().unwrap()[i] = (i * i * i) as u64;
            });
        }
        task_set.wait();
    }

    let a = Arc::try_unwrap(a).unwrap().into_inner().unwrap();
    let b = Arc::try_unwrap(b).unwrap().into_inner().unwrap();
    for i in 0..N {
        assert_eq!(a[i], (i * i) as u64);
        assert_eq!(b[i], (i * i * i) as u64);
    }
}
