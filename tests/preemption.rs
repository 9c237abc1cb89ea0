//! Cooperative preemption through the guard API.

use std::{
    thread,
    time::{Duration, Instant},
};

use lockstep::{ExecutionContext, Locker};

#[test]
fn test_preemption_request_and_acknowledge() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = ExecutionContext::new();
    let locker = Locker::new(&ctx);
    locker.start_preemption(Duration::from_millis(5));

    // The interpreter's safe-point loop: poll, acknowledge, continue.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ctx.preemption_requested() {
        assert!(
            Instant::now() < deadline,
            "no preemption request within two seconds"
        );
        thread::sleep(Duration::from_millis(1));
    }
    ctx.acknowledge_preemption();
    assert!(!ctx.preemption_requested());

    locker.stop_preemption();
    // Stop joined the worker and withdrew any raced-in request; the flag stays clear.
    for _ in 0..20 {
        assert!(!ctx.preemption_requested());
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_restart_retunes_running_worker() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = ExecutionContext::new();
    let locker = Locker::new(&ctx);

    // Starting twice must not spawn a second worker; the second call retunes the first.
    locker.start_preemption(Duration::from_millis(500));
    locker.start_preemption(Duration::from_millis(2));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !ctx.preemption_requested() {
        assert!(
            Instant::now() < deadline,
            "retuned worker never fired at the shorter interval"
        );
        thread::sleep(Duration::from_millis(1));
    }
    locker.stop_preemption();
}
