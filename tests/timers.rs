use scarlet::time::sleep;
use scarlet::{EventThread, TimerGroup};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn init() -> EventThread {
    let _ = env_logger::builder().is_test(true).try_init();
    EventThread::new().unwrap()
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let lp = init();
    let fired = Rc::new(RefCell::new(Vec::new()));

    for (index, delay) in [300u64, 100, 200].into_iter().enumerate() {
        let fired = fired.clone();
        lp.schedule_after(Duration::from_millis(delay), move || fired.borrow_mut().push(index));
    }

    lp.run_until_complete(sleep(&lp, Duration::from_millis(350))).unwrap();
    assert_eq!(*fired.borrow(), vec![1, 2, 0]);
}

#[test]
fn test_equal_deadlines_fire_in_insertion_order() {
    let lp = init();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let when = lp.time() + Duration::from_millis(5);

    for index in 0..5 {
        let fired = fired.clone();
        lp.schedule_at(when, move || fired.borrow_mut().push(index));
    }

    lp.run_until_complete(sleep(&lp, Duration::from_millis(10))).unwrap();
    assert_eq!(*fired.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_cancelled_timer_never_fires() {
    let lp = init();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let early = {
        let fired = fired.clone();
        lp.schedule_after(Duration::from_millis(1), move || fired.borrow_mut().push("early"))
    };
    {
        let fired = fired.clone();
        lp.schedule_after(Duration::from_millis(2), move || fired.borrow_mut().push("late"));
    }
    early.cancel();
    assert!(early.cancelled());

    lp.run_until_complete(sleep(&lp, Duration::from_millis(10))).unwrap();
    assert_eq!(*fired.borrow(), vec!["late"]);
}

#[test]
fn test_sleep_waits_at_least_the_delay() {
    let lp = init();
    let start = Instant::now();

    lp.run_until_complete(sleep(&lp, Duration::from_millis(50))).unwrap();

    assert!(
        start.elapsed() >= Duration::from_millis(50),
        "sleep should wait at least the specified duration"
    );
}

#[test]
fn test_zero_sleep_completes_on_the_next_tick() {
    let lp = init();
    let nap = sleep(&lp, Duration::ZERO);
    assert!(!nap.done(), "zero sleep must not complete synchronously");

    lp.run_once().unwrap();
    assert!(nap.done());
}

#[test]
fn test_cancelling_sleep_cancels_its_timer() {
    let lp = init();
    let nap = sleep(&lp, Duration::from_secs(5));

    assert!(nap.cancel());
    assert!(nap.cancelled());

    let start = Instant::now();
    lp.run_until_complete(sleep(&lp, Duration::from_millis(5))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_timer_group_outlived_by_loop() {
    let lp = init();
    let fired = Rc::new(RefCell::new(0));

    {
        let group = TimerGroup::new(&lp);
        let fired = fired.clone();
        group.schedule_after(Duration::from_millis(1), move || *fired.borrow_mut() += 1);
    }

    lp.run_until_complete(sleep(&lp, Duration::from_millis(10))).unwrap();
    assert_eq!(*fired.borrow(), 0);
}
