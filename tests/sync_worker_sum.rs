//! Seed scenario: a pool of sync workers, each summing the pair it's given,
//! dispatched round-robin and collected back through `LoopFuture`s.

use async_ipc_rt::future::FutureResult;
use async_ipc_rt::{Codec, Loop, Pool};
use std::rc::Rc;

#[test]
fn pool_of_sync_workers_sums_pairs() {
    let l = Loop::new().unwrap();
    let pool: Rc<Pool<(u32, u32), u32>> = Rc::new(Pool::new_sync(l.clone(), Codec::Native, 4, |(a, b)| a + b));

    let inputs = [(1, 2), (10, 20), (100, 200), (5, 5), (7, 8)];
    let futs: Vec<_> = inputs.iter().map(|pair| pool.call(pair).unwrap()).collect();

    l.once(Some(std::time::Duration::from_millis(500)), None::<fn(&Loop)>);

    for (pair, fut) in inputs.iter().zip(futs) {
        match fut.wait() {
            FutureResult::Done(sum) => assert_eq!(sum, pair.0 + pair.1),
            other => panic!("worker did not complete: {other:?}"),
        }
    }
}
