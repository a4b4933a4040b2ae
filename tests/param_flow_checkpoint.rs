use parking_lot::Mutex;
use std::time::Duration;
use tollgate::{
    entry_with, load_param_flow_rules, BlockError, FlowGrade, ParamFlowRule, ParamValue,
    ResourceId,
};

static RULE_ENV: Mutex<()> = Mutex::new(());

fn hot_call(resource: &str, key: &str) -> Result<(), BlockError> {
    let admitted = entry_with(
        ResourceId::outbound(resource),
        1,
        &[ParamValue::from(key)],
    )?;
    admitted.exit().expect("LIFO exit");
    Ok(())
}

#[test]
fn param_checkpoint_values_count_independently() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.basic", 0, 2.0)]);

    assert!(hot_call("param.chk.basic", "x").is_ok());
    assert!(hot_call("param.chk.basic", "x").is_ok());
    match hot_call("param.chk.basic", "x") {
        Err(BlockError::ParamFlow { param, .. }) => {
            assert_eq!(param, Some(ParamValue::from("x")));
        }
        other => panic!("expected param flow block, got {other:?}"),
    }
    // A different value has an untouched budget.
    assert!(hot_call("param.chk.basic", "y").is_ok());
}

#[test]
fn param_checkpoint_window_refills_the_bucket() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.refill", 0, 2.0)]);

    assert!(hot_call("param.chk.refill", "k").is_ok());
    assert!(hot_call("param.chk.refill", "k").is_ok());
    assert!(hot_call("param.chk.refill", "k").is_err());

    std::thread::sleep(Duration::from_millis(1100));
    assert!(
        hot_call("param.chk.refill", "k").is_ok(),
        "a full window elapsed: tokens refilled"
    );
}

#[test]
fn param_checkpoint_negative_index_resolves_per_call() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.negidx", -1, 1.0)]);

    let args = [ParamValue::from("first"), ParamValue::from("last")];
    // -1 resolves to the final argument.
    entry_with(ResourceId::outbound("param.chk.negidx"), 1, &args)
        .expect("admitted")
        .exit()
        .expect("LIFO exit");
    match entry_with(ResourceId::outbound("param.chk.negidx"), 1, &args) {
        Err(BlockError::ParamFlow { param, .. }) => {
            assert_eq!(param, Some(ParamValue::from("last")));
        }
        other => panic!("expected block on the last argument, got {other:?}"),
    }

    // Out of range for this call: the rule is simply inert, and stays
    // usable for later calls with enough arguments.
    for _ in 0..3 {
        entry_with(ResourceId::outbound("param.chk.negidx"), 1, &[])
            .expect("rule disabled for argument-less calls")
            .exit()
            .expect("LIFO exit");
    }
    assert!(
        entry_with(ResourceId::outbound("param.chk.negidx"), 1, &args).is_err(),
        "rule still enforced once arguments are back"
    );
}

#[test]
fn param_checkpoint_item_overrides_one_value() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.items", 0, 1.0)
        .with_item(ParamValue::from("vip"), 3)]);

    for _ in 0..3 {
        assert!(hot_call("param.chk.items", "vip").is_ok());
    }
    assert!(hot_call("param.chk.items", "vip").is_err());

    assert!(hot_call("param.chk.items", "plain").is_ok());
    assert!(hot_call("param.chk.items", "plain").is_err());
}

#[test]
fn param_checkpoint_sequence_rejects_on_first_hot_element() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.seq", 0, 1.0)]);

    let seq = ParamValue::Seq(vec![ParamValue::from("a"), ParamValue::from("b")]);
    entry_with(ResourceId::outbound("param.chk.seq"), 1, std::slice::from_ref(&seq))
        .expect("both elements within budget")
        .exit()
        .expect("LIFO exit");
    // "a" is exhausted now; the sequence as a whole is rejected.
    assert!(
        entry_with(ResourceId::outbound("param.chk.seq"), 1, std::slice::from_ref(&seq)).is_err()
    );
}

#[test]
fn param_checkpoint_thread_grade_follows_live_entries() {
    let _guard = RULE_ENV.lock();
    load_param_flow_rules(vec![ParamFlowRule::qps("param.chk.threads", 0, 1.0)
        .with_grade(FlowGrade::Thread)]);

    let key = [ParamValue::from("conn")];
    let held = entry_with(ResourceId::outbound("param.chk.threads"), 1, &key)
        .expect("first live call admitted");
    assert!(
        entry_with(ResourceId::outbound("param.chk.threads"), 1, &key).is_err(),
        "second concurrent call on the same value is rejected"
    );
    // A different value is unaffected.
    entry_with(
        ResourceId::outbound("param.chk.threads"),
        1,
        &[ParamValue::from("other")],
    )
    .expect("independent value admitted")
    .exit()
    .expect("LIFO exit");

    held.exit().expect("LIFO exit");
    entry_with(ResourceId::outbound("param.chk.threads"), 1, &key)
        .expect("slot freed after exit")
        .exit()
        .expect("LIFO exit");
}
