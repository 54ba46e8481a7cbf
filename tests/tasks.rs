use scarlet::time::{future_or_timeout, sleep, wait_for};
use scarlet::{Error, EventThread, yield_now};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn init() -> EventThread {
    let _ = env_logger::builder().is_test(true).try_init();
    EventThread::new().unwrap()
}

#[test]
fn test_immediate_value_takes_one_step() {
    let lp = init();
    let task = lp.spawn(async { Ok(7) });

    assert!(!task.done(), "tasks never run during construction");
    lp.run_once().unwrap();

    assert!(task.done());
    assert_eq!(task.steps(), 1);
    assert_eq!(task.result().unwrap(), 7);
}

#[test]
fn test_task_resumes_once_per_awaited_future() {
    let lp = init();
    let first = lp.create_future::<u32>();
    let second = lp.create_future::<u32>();

    let (a, b) = (first.clone(), second.clone());
    let task = lp.spawn(async move { Ok(a.await? + b.await?) });

    lp.schedule_after(Duration::from_millis(5), move || {
        first.set_result(1).unwrap();
    });
    lp.schedule_after(Duration::from_millis(20), move || {
        second.set_result(2).unwrap();
    });

    assert_eq!(lp.run_until_complete(task.clone()).unwrap(), 3);
    assert_eq!(task.steps(), 3);
}

#[test]
fn test_awaiting_done_future_does_not_suspend() {
    let lp = init();
    let first = lp.create_future::<u32>();
    let second = lp.create_future::<u32>();
    first.set_result(1).unwrap();
    second.set_result(2).unwrap();

    let (a, b) = (first.clone(), second.clone());
    let task = lp.spawn(async move { Ok(a.await? + b.await?) });

    assert_eq!(lp.run_until_complete(task.clone()).unwrap(), 3);
    assert_eq!(task.steps(), 1);
}

#[test]
fn test_cancel_during_sleep_short_circuits() {
    let lp = init();
    let nap = sleep(&lp, Duration::from_secs(5));
    let task = lp.spawn(async move {
        nap.await?;
        Ok("woke up")
    });

    lp.run_once().unwrap();
    assert!(task.cancel());

    let start = Instant::now();
    let result = lp.run_until_complete(task.clone());

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(task.cancelled());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_cancel_before_first_step() {
    let lp = init();
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    let task = lp.spawn(async move {
        flag.set(true);
        yield_now().await;
        Ok(())
    });
    task.cancel();

    assert!(matches!(lp.run_until_complete(task.clone()), Err(Error::Cancelled)));
    assert!(task.cancelled());
}

#[test]
fn test_computation_can_handle_cancellation() {
    let lp = init();
    let blocker = lp.create_future::<()>();

    let awaited = blocker.clone();
    let task = lp.spawn(async move {
        match awaited.await {
            Err(Error::Cancelled) => Ok("cleaned up"),
            other => other.map(|_| "finished"),
        }
    });

    lp.run_once().unwrap();
    task.cancel();

    assert_eq!(lp.run_until_complete(task).unwrap(), "cleaned up");
    assert!(blocker.cancelled());
}

#[test]
fn test_error_and_panic_finish_the_task() {
    let lp = init();

    let failing = lp.spawn(async { Err::<(), _>(Error::msg("boom")) });
    let err = lp.run_until_complete(failing).unwrap_err();
    assert_eq!(err.to_string(), "boom");

    let panicking = lp.spawn(async {
        if true {
            panic!("step exploded");
        }
        Ok(())
    });
    match lp.run_until_complete(panicking) {
        Err(Error::Panic(message)) => assert!(message.contains("step exploded")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_task_awaiting_task_shows_in_stack() {
    let lp = EventThread::builder().debug(true).build().unwrap();
    let gate = lp.create_future::<u32>();

    let inner_gate = gate.clone();
    let inner = lp.spawn_named("inner", async move { inner_gate.await });
    let outer = lp.spawn_named("outer", async move { inner.await });

    lp.run_once().unwrap();

    let stack = outer.get_stack(None);
    assert_eq!(stack.len(), 2);
    assert!(stack[0].contains("'outer'"));
    assert!(stack[1].contains("'inner'"));
    assert!(stack[1].contains("spawned at"));
    assert_eq!(outer.get_stack(Some(1)).len(), 1);

    gate.set_result(5).unwrap();
    assert_eq!(lp.run_until_complete(outer).unwrap(), 5);
}

#[test]
fn test_second_awaiter_is_rejected() {
    let lp = init();
    let shared = lp.create_future::<u32>();

    let first = shared.clone();
    let a = lp.spawn(async move { first.await });
    let second = shared.clone();
    let b = lp.spawn(async move { second.await });

    lp.run_once().unwrap();
    assert!(matches!(b.result(), Err(Error::InvalidState(_))));

    shared.set_result(1).unwrap();
    assert_eq!(lp.run_until_complete(a).unwrap(), 1);
}

#[test]
fn test_future_or_timeout_expires_plain_future() {
    let lp = init();
    let never = lp.create_future::<u32>();

    let bounded = future_or_timeout(never.clone(), Duration::from_millis(5));
    assert!(matches!(lp.run_until_complete(bounded), Err(Error::Timeout)));
    assert!(never.done());
}

#[test]
fn test_future_or_timeout_on_task_reports_timeout() {
    let lp = init();
    let nap = sleep(&lp, Duration::from_secs(5));
    let awaited = nap.clone();
    let task = lp.spawn(async move { awaited.await });

    let bounded = future_or_timeout(task.future().clone(), Duration::from_millis(5));
    assert!(matches!(lp.run_until_complete(bounded), Err(Error::Timeout)));

    assert!(task.done());
    assert!(!task.cancelled(), "a timed out task is not reported as plainly cancelled");
    assert!(nap.cancelled());
}

#[test]
fn test_wait_for_times_out_task() {
    let lp = init();
    let nap = sleep(&lp, Duration::from_secs(5));

    let result = lp.run_until_complete(wait_for(&lp, async move { nap.await }, Duration::from_millis(10)));
    assert!(matches!(result, Err(Error::Timeout)));
}

#[test]
fn test_wait_for_returns_value_before_deadline() {
    let lp = init();
    let nap = sleep(&lp, Duration::from_millis(1));

    let result = lp.run_until_complete(wait_for(
        &lp,
        async move {
            nap.await?;
            Ok(11)
        },
        Duration::from_secs(5),
    ));
    assert_eq!(result.unwrap(), 11);
}

#[test]
fn test_ensure_future_rejects_other_loop() {
    let lp = init();
    let other = init();
    let foreign = other.create_future::<u32>();

    assert!(matches!(lp.ensure_future(foreign), Err(Error::InvalidState(_))));
}

#[test]
fn test_close_cancels_live_tasks() {
    let lp = init();
    let task = lp.spawn(sleep(&lp, Duration::from_secs(60)));

    lp.run_once().unwrap();
    assert_eq!(lp.task_count(), 1);

    lp.close().unwrap();
    assert!(task.cancelled());
    assert_eq!(lp.task_count(), 0);
    assert!(lp.schedule_now(|| {}).is_none());
}
