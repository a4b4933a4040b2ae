use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tollgate::{
    cluster_node, config, entry, entry_with, entry_with_priority, load_flow_rules,
    ControlBehavior, FlowGrade, FlowRule, ResourceId,
};

// Flow rule loads replace the whole active set, so tests in this binary
// serialize on one lock.
static RULE_ENV: Mutex<()> = Mutex::new(());

#[test]
fn flow_checkpoint_qps_reject_splits_a_burst() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![FlowRule::qps("flow.chk.reject", 10.0)]);

    let mut passed = 0;
    let mut blocked = 0;
    for _ in 0..20 {
        match entry("flow.chk.reject") {
            Ok(admitted) => {
                passed += 1;
                admitted.exit().expect("LIFO exit");
            }
            Err(_) => blocked += 1,
        }
    }
    assert_eq!(passed, 10, "first 10 admissions fit the threshold");
    assert_eq!(blocked, 10, "the rest of the burst is rejected");

    let aggregate = cluster_node("flow.chk.reject").expect("cluster node exists");
    assert!((aggregate.stats().pass_qps() - 10.0).abs() < 1.0);
    assert!((aggregate.stats().block_qps() - 10.0).abs() < 1.0);
}

#[test]
fn flow_checkpoint_throttle_paces_and_caps_the_queue() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![FlowRule::qps("flow.chk.throttle", 5.0)
        .with_behavior(ControlBehavior::Throttle)
        .with_max_queueing_time_ms(1000)]);

    let started = Instant::now();
    let handles: Vec<_> = (0..7)
        .map(|_| {
            std::thread::spawn(|| {
                let begun = Instant::now();
                let result = entry("flow.chk.throttle");
                let elapsed = begun.elapsed();
                if let Ok(admitted) = result {
                    admitted.exit().expect("LIFO exit");
                    (true, elapsed)
                } else {
                    (false, elapsed)
                }
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker finished"))
        .collect();

    let passed: Vec<_> = outcomes.iter().filter(|(ok, _)| *ok).collect();
    let rejected: Vec<_> = outcomes.iter().filter(|(ok, _)| !*ok).collect();
    assert_eq!(passed.len(), 6, "five slots plus the 1000 ms queue tail");
    assert_eq!(rejected.len(), 1, "the seventh exceeds the queue cap");

    // Admissions spread ~200 ms apart; the deepest queued one waited
    // close to the full second.
    let longest = passed.iter().map(|(_, e)| *e).max().expect("some admission");
    assert!(longest >= Duration::from_millis(700), "longest wait {longest:?}");
    // The rejection does not queue.
    assert!(rejected[0].1 < Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn flow_checkpoint_warm_up_holds_the_cold_rate() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![FlowRule::qps("flow.chk.warmup", 6.0)
        .with_behavior(ControlBehavior::WarmUp)
        .with_warm_up_period_sec(10)]);

    let mut passed = 0;
    for _ in 0..10 {
        if let Ok(admitted) = entry("flow.chk.warmup") {
            passed += 1;
            admitted.exit().expect("LIFO exit");
        }
    }
    // Cold rate is count/cold_factor = 2.
    assert!((1..=3).contains(&passed), "cold start admitted {passed}");
}

#[test]
fn flow_checkpoint_priority_borrows_a_future_window() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![FlowRule::qps("flow.chk.priority", 2.0)]);
    config::set_occupy_timeout_ms(1000);

    for _ in 0..2 {
        entry("flow.chk.priority")
            .expect("within threshold")
            .exit()
            .expect("LIFO exit");
    }
    std::thread::sleep(Duration::from_millis(50));
    // The window is full: a plain request is rejected outright.
    assert!(entry("flow.chk.priority").is_err());

    // A prioritized one sleeps into a borrowed window instead.
    let begun = Instant::now();
    let admitted = entry_with_priority(ResourceId::outbound("flow.chk.priority"), 1, &[])
        .expect("priority admission");
    assert!(begun.elapsed() >= Duration::from_millis(300));
    admitted.exit().expect("LIFO exit");

    config::set_occupy_timeout_ms(500);
}

#[test]
fn flow_checkpoint_thread_grade_tracks_live_calls() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![
        FlowRule::qps("flow.chk.threads", 1.0).with_grade(FlowGrade::Thread)
    ]);

    let held =
        entry_with(ResourceId::outbound("flow.chk.threads"), 1, &[]).expect("first call admitted");
    assert!(
        entry("flow.chk.threads").is_err(),
        "second concurrent call exceeds the thread cap"
    );
    held.exit().expect("LIFO exit");
    entry("flow.chk.threads")
        .expect("slot freed after exit")
        .exit()
        .expect("LIFO exit");
}

#[test]
fn flow_checkpoint_rules_load_from_json() {
    let _guard = RULE_ENV.lock();
    let rules: Vec<FlowRule> = serde_json::from_str(
        r#"[
            {"resource": "flow.chk.json", "count": 3.0},
            {"resource": "flow.chk.json.throttle", "count": 5.0,
             "control_behavior": "Throttle", "max_queueing_time_ms": 200}
        ]"#,
    )
    .expect("rule document parses");
    load_flow_rules(rules);

    let mut passed = 0;
    for _ in 0..5 {
        if let Ok(admitted) = entry("flow.chk.json") {
            passed += 1;
            admitted.exit().expect("LIFO exit");
        }
    }
    assert_eq!(passed, 3);
}
