use parking_lot::Mutex;
use tollgate::{
    enter_context, enter_context_with_origin, entry, exit_context, load_flow_rules, FlowRule,
    FlowStrategy,
};

static RULE_ENV: Mutex<()> = Mutex::new(());

#[test]
fn strategy_checkpoint_relate_measures_the_referenced_resource() {
    let _guard = RULE_ENV.lock();
    // Writes to `strategy.rel.read` yield while `strategy.rel.write` is
    // busy: the read rule measures the write resource's aggregate.
    load_flow_rules(vec![FlowRule::qps("strategy.rel.read", 1.0)
        .with_strategy(FlowStrategy::Relate, "strategy.rel.write")]);

    // Nothing on the write side yet: reads flow.
    entry("strategy.rel.read")
        .expect("no write pressure")
        .exit()
        .expect("LIFO exit");

    for _ in 0..2 {
        entry("strategy.rel.write")
            .expect("writes are unruled")
            .exit()
            .expect("LIFO exit");
    }
    assert!(
        entry("strategy.rel.read").is_err(),
        "write pressure starves reads"
    );
}

#[test]
fn strategy_checkpoint_chain_limits_one_entrance_only() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![FlowRule::qps("strategy.chain.res", 0.0)
        .with_strategy(FlowStrategy::Chain, "strategy.chain.hot")]);

    enter_context("strategy.chain.hot");
    assert!(
        entry("strategy.chain.res").is_err(),
        "calls through the named entrance are limited"
    );
    exit_context();

    enter_context("strategy.chain.cold");
    entry("strategy.chain.res")
        .expect("other entrances are not covered by the chain rule")
        .exit()
        .expect("LIFO exit");
    exit_context();
}

#[test]
fn strategy_checkpoint_origin_rule_limits_one_caller() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![
        FlowRule::qps("strategy.origin.res", 0.0).with_limit_origin("noisy-app")
    ]);

    enter_context_with_origin("strategy.origin.ctx.noisy", "noisy-app");
    assert!(
        entry("strategy.origin.res").is_err(),
        "the named origin is limited"
    );
    exit_context();

    enter_context_with_origin("strategy.origin.ctx.quiet", "quiet-app");
    entry("strategy.origin.res")
        .expect("other origins are untouched by the origin rule")
        .exit()
        .expect("LIFO exit");
    exit_context();
}

#[test]
fn strategy_checkpoint_other_covers_unnamed_origins() {
    let _guard = RULE_ENV.lock();
    load_flow_rules(vec![
        FlowRule::qps("strategy.other.res", 100.0).with_limit_origin("vip-app"),
        FlowRule::qps("strategy.other.res", 0.0).with_limit_origin("other"),
    ]);

    enter_context_with_origin("strategy.other.ctx.vip", "vip-app");
    entry("strategy.other.res")
        .expect("explicitly named origin uses its own generous rule")
        .exit()
        .expect("LIFO exit");
    exit_context();

    enter_context_with_origin("strategy.other.ctx.anon", "some-other-app");
    assert!(
        entry("strategy.other.res").is_err(),
        "unnamed origins fall under the `other` rule"
    );
    exit_context();
}
