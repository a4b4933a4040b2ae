use parking_lot::Mutex;
use std::time::Duration;
use tollgate::{entry, load_degrade_rules, BlockError, DegradeRule};

static RULE_ENV: Mutex<()> = Mutex::new(());

fn slow_call(resource: &str, rt_ms: u64) -> bool {
    match entry(resource) {
        Ok(admitted) => {
            std::thread::sleep(Duration::from_millis(rt_ms));
            admitted.exit().expect("LIFO exit");
            true
        }
        Err(_) => false,
    }
}

#[test]
fn degrade_checkpoint_avg_rt_trips_and_recovers() {
    let _guard = RULE_ENV.lock();
    load_degrade_rules(vec![DegradeRule::avg_rt("degrade.chk.rt", 10.0, 2)]);

    // Five slow observations ride out probation; the sixth trips.
    for call in 0..5 {
        assert!(slow_call("degrade.chk.rt", 20), "call {call} passes");
    }
    assert!(!slow_call("degrade.chk.rt", 20), "sixth call trips the breaker");

    // Open window: still rejected a second in.
    std::thread::sleep(Duration::from_millis(1000));
    match entry("degrade.chk.rt") {
        Err(BlockError::Degrade { .. }) => {}
        other => panic!("expected degrade block, got {other:?}"),
    }

    // Past the window the breaker closed and the slow samples lapsed.
    std::thread::sleep(Duration::from_millis(1200));
    entry("degrade.chk.rt")
        .expect("breaker closed after the time window")
        .exit()
        .expect("LIFO exit");
}

#[test]
fn degrade_checkpoint_exception_ratio_trips_and_recovers() {
    let _guard = RULE_ENV.lock();
    load_degrade_rules(vec![DegradeRule::exception_ratio(
        "degrade.chk.ratio",
        0.2,
        2,
    )]);

    // 100 clean calls, then a burst of failing ones, all inside one
    // window. The ratio crosses 0.2 partway through the burst, so the
    // breaker trips while the burst is still arriving.
    for _ in 0..100 {
        entry("degrade.chk.ratio")
            .expect("clean call admitted")
            .exit()
            .expect("LIFO exit");
    }
    let mut failures_admitted = 0;
    for _ in 0..30 {
        if let Ok(admitted) = entry("degrade.chk.ratio") {
            admitted.record_error("downstream unavailable");
            admitted.exit().expect("LIFO exit");
            failures_admitted += 1;
        }
    }
    assert!(
        (20..30).contains(&failures_admitted),
        "breaker trips once the ratio crosses the threshold, admitted {failures_admitted}"
    );

    match entry("degrade.chk.ratio") {
        Err(BlockError::Degrade { .. }) => {}
        other => panic!("breaker should be open, got {other:?}"),
    }

    // After the window (and once the burst lapsed from the stats) the
    // breaker closes again.
    std::thread::sleep(Duration::from_millis(2200));
    entry("degrade.chk.ratio")
        .expect("breaker closed after the time window")
        .exit()
        .expect("LIFO exit");
}

#[test]
fn degrade_checkpoint_exception_count_uses_minute_totals() {
    let _guard = RULE_ENV.lock();
    load_degrade_rules(vec![DegradeRule::exception_count(
        "degrade.chk.count",
        5.0,
        1,
    )]);

    for _ in 0..5 {
        let admitted = entry("degrade.chk.count").expect("admitted");
        admitted.record_error("boom");
        admitted.exit().expect("LIFO exit");
    }
    match entry("degrade.chk.count") {
        Err(BlockError::Degrade { .. }) => {}
        other => panic!("expected degrade block, got {other:?}"),
    }
}
