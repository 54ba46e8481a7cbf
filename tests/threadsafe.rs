use scarlet::time::sleep;
use scarlet::{Error, EventThread, LoopHandle};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn spawn_loop() -> scarlet::SpawnedLoop {
    let _ = env_logger::builder().is_test(true).try_init();
    EventThread::builder().name("scarlet-test-loop").spawn().unwrap()
}

fn ping(handle: &LoopHandle) -> i32 {
    handle
        .run_blocking(|_| Box::pin(async { Ok(1) }), Some(Duration::from_secs(5)))
        .unwrap()
}

#[test]
fn test_run_blocking_returns_value_from_loop() {
    let spawned = spawn_loop();

    let answer = spawned
        .handle()
        .run_blocking(
            |lp| {
                let nap = sleep(lp, Duration::from_millis(5));
                let name = lp.name().map(String::from);
                Box::pin(async move {
                    nap.await?;
                    Ok(name)
                })
            },
            None,
        )
        .unwrap();

    assert_eq!(answer.as_deref(), Some("scarlet-test-loop"));
    spawned.stop_and_join().unwrap();
}

#[test]
fn test_run_blocking_timeout_cancels_the_task() {
    let spawned = spawn_loop();

    let result = spawned.handle().run_blocking(
        |lp| {
            let nap = sleep(lp, Duration::from_secs(60));
            Box::pin(async move { nap.await })
        },
        Some(Duration::from_millis(20)),
    );
    assert!(matches!(result, Err(Error::Timeout)));

    assert_eq!(ping(spawned.handle()), 1, "loop keeps serving after a timeout");
    spawned.stop_and_join().unwrap();
}

#[test]
fn test_schedule_now_threadsafe_wakes_blocked_loop() {
    let spawned = spawn_loop();
    let (tx, rx) = mpsc::channel();

    let handle = spawned.handle().clone();
    thread::spawn(move || {
        handle.schedule_now_threadsafe(move |lp| {
            let _ = tx.send(lp.task_count());
        });
    })
    .join()
    .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    spawned.stop_and_join().unwrap();
}

#[test]
fn test_pause_holds_the_loop_between_ticks() {
    let spawned = spawn_loop();
    let handle = spawned.handle().clone();
    ping(&handle);

    let guard = handle.pause(Some(Duration::from_secs(5))).unwrap();
    assert!(handle.is_paused());

    let (tx, rx) = mpsc::channel();
    handle.schedule_now_threadsafe(move |_| {
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err(), "paused loop must not run callbacks");

    drop(guard);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!handle.is_paused());

    spawned.stop_and_join().unwrap();
}

#[test]
fn test_loop_thread_entry_points_are_rejected() {
    let lp = EventThread::new().unwrap();
    let handle = lp.handle();

    assert!(handle.is_loop_thread());
    assert!(matches!(handle.pause(None), Err(Error::InvalidState(_))));
    assert!(matches!(
        handle.run_blocking(|_| Box::pin(async { Ok(()) }), None),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_stop_is_idempotent_and_closed_loop_rejects_work() {
    let spawned = spawn_loop();
    let handle = spawned.handle().clone();

    handle.stop();
    handle.stop();
    spawned.join().unwrap();

    assert!(handle.is_closed());
    assert!(!handle.schedule_now_threadsafe(|_| {}));
    assert!(matches!(
        handle.run_blocking(|_| Box::pin(async { Ok(()) }), None),
        Err(Error::InvalidState(_))
    ));
}
