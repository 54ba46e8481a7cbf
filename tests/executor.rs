use scarlet::{Error, EventThread};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, thiserror::Error)]
#[error("ValueError: {0}")]
struct ValueError(String);

fn init() -> EventThread {
    let _ = env_logger::builder().is_test(true).try_init();
    EventThread::builder()
        .min_kept_workers(1)
        .worker_name_prefix("test-worker")
        .build()
        .unwrap()
}

#[test]
fn test_error_is_delivered_and_worker_survives() {
    let lp = init();

    let failing = lp.run_in_executor(|| Err::<u32, _>(anyhow::Error::new(ValueError("x".into()))));
    let err = lp.run_until_complete(failing.clone()).unwrap_err();
    assert_eq!(err.downcast_ref::<ValueError>().map(|e| e.0.as_str()), Some("x"));
    assert!(failing.done());

    let name = lp.run_in_executor(|| Ok::<_, Error>(thread::current().name().map(String::from)));
    assert_eq!(lp.run_until_complete(name).unwrap().as_deref(), Some("test-worker-0"));
    assert_eq!(lp.idle_workers(), 1);
    assert_eq!(lp.busy_workers(), 0);
}

#[test]
fn test_panicking_callable_fails_its_future_only() {
    let lp = init();

    let panicking = lp.run_in_executor(|| -> Result<u32, Error> { panic!("worker blew up") });
    match lp.run_until_complete(panicking) {
        Err(Error::Panic(message)) => assert!(message.contains("worker blew up")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let after = lp.run_in_executor(|| Ok::<_, Error>(5));
    assert_eq!(lp.run_until_complete(after).unwrap(), 5);
}

#[test]
fn test_claimed_executor_runs_on_one_thread() {
    let lp = init();
    let claim = lp.claim_executor().unwrap();

    let ids: Vec<_> = (0..3)
        .map(|_| claim.run(|| Ok::<_, Error>(thread::current().id())))
        .collect();
    let mut seen = Vec::new();
    for id in ids {
        seen.push(lp.run_until_complete(id).unwrap());
    }
    assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(lp.busy_workers(), 1);

    claim.release();
    assert_eq!(lp.busy_workers(), 0);
    assert!(matches!(
        lp.run_until_complete(claim.run(|| Ok::<_, Error>(()))),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_cancelled_job_is_skipped() {
    let lp = init();
    let claim = lp.claim_executor().unwrap();
    let (release, gate) = mpsc::channel::<()>();
    let ran = Arc::new(AtomicBool::new(false));

    let blocker = claim.run(move || {
        let _ = gate.recv();
        Ok::<_, Error>(())
    });
    let flag = ran.clone();
    let skipped = claim.run(move || {
        flag.store(true, Ordering::SeqCst);
        Ok::<_, Error>(())
    });

    assert!(skipped.cancel());
    lp.run_once().unwrap();
    release.send(()).unwrap();

    lp.run_until_complete(blocker).unwrap();
    let after = claim.run(|| Ok::<_, Error>(()));
    lp.run_until_complete(after).unwrap();

    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_close_cancels_undelivered_jobs() {
    let lp = init();
    let claim = lp.claim_executor().unwrap();
    let (release, gate) = mpsc::channel::<()>();

    let running = claim.run(move || {
        let _ = gate.recv();
        Ok::<_, Error>(())
    });
    let queued = claim.run(|| Ok::<_, Error>(()));

    lp.close().unwrap();
    assert!(running.cancelled());
    assert!(queued.cancelled());
    let _ = release.send(());
}
