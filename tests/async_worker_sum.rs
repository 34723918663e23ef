//! Seed scenario: an async routine whose child builds its own nested `Loop`
//! and runs `before`/`after` hooks around `Loop::start()`. The worker here
//! replies to each request on its own channel's `on_frame` callback, driven
//! entirely by its own event loop rather than a blocking read/compute/write
//! cycle.

use async_ipc_rt::future::FutureResult;
use async_ipc_rt::{Codec, Loop, Routine};

#[test]
fn async_worker_sums_requests_via_its_own_loop() {
    let l = Loop::new().unwrap();

    let routine: std::rc::Rc<Routine<(u32, u32), u32>> = Routine::spawn_async(
        l.clone(),
        Codec::Native,
        |_child_loop, child_chan| {
            let codec = Codec::Native;
            let chan = child_chan.clone();
            child_chan.on_frame(move |_, payload| {
                let (a, b): (u32, u32) = codec.decode(&payload).unwrap();
                chan.send(&(a + b)).unwrap();
            });
        },
        |_child_loop| {},
    )
    .unwrap();

    let fut = routine.call(&l, &(19, 23)).unwrap();
    l.once(Some(std::time::Duration::from_millis(500)), None::<fn(&Loop)>);

    match fut.wait() {
        FutureResult::Done(sum) => assert_eq!(sum, 42),
        other => panic!("async worker did not complete: {other:?}"),
    }
}
