use eip_core::aggregation::StringConcatStrategy;
use eip_core::error::EipError;
use eip_core::errorhandler::{ExceptionMatcher, RedeliveryPolicy};
use eip_core::exchange::{
    Exchange,
    keys::{header, property},
};
use eip_core::expression::{self, predicate};
use eip_core::processor::{SharedProcessor, processor_fn};
use eip_core::registry::Registry;
use eip_macros::processor;
use eip_runtime::config::ContextConfig;
use eip_runtime::model::{
    AggregateDefinition, ChoiceDefinition, ErrorHandlerDefinition, LoopDefinition,
    MulticastDefinition, OnExceptionDefinition, RouteDefinition, StepDefinition,
};
use eip_runtime::{EipContext, RuntimeError};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("invalid order")]
struct InvalidOrder;

fn fail_with(err: fn() -> anyhow::Error) -> SharedProcessor {
    processor_fn(move |_| Err(err()))
}

fn counting(calls: Arc<AtomicUsize>, fail: bool) -> SharedProcessor {
    processor_fn(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        if fail {
            anyhow::bail!("branch failed");
        }
        Ok(())
    })
}

fn no_delay(max: i32) -> RedeliveryPolicy {
    RedeliveryPolicy::builder()
        .maximum_redeliveries(max)
        .redelivery_delay(0)
        .build()
}

#[processor]
fn enrich(exchange: &mut Exchange) -> anyhow::Result<()> {
    exchange.set_header("enriched", true);
    Ok(())
}

#[tokio::test]
async fn dead_letter_records_the_failing_route() {
    let context = EipContext::builder()
        .error_handler(ErrorHandlerDefinition::dead_letter("mock:dead"))
        .build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("A")
                .from("direct:a")
                .steps(vec![
                    StepDefinition::to("direct:b"),
                    StepDefinition::to("mock:after"),
                ])
                .build(),
        )
        .unwrap();
    context
        .add_route(
            RouteDefinition::builder()
                .id("B")
                .from("direct:b")
                .steps(vec![StepDefinition::process(fail_with(|| {
                    anyhow::anyhow!("boom")
                }))])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let dead = context.mock_endpoint("mock:dead").unwrap();
    dead.expected_message_count(1);
    let after = context.mock_endpoint("mock:after").unwrap();

    let template = context.create_producer_template();
    template.send_body("direct:a", "payload").await.unwrap();

    dead.assert_is_satisfied(WAIT).await.unwrap();
    let received = dead.received_exchanges();
    assert_eq!(
        received[0].property(property::FAILURE_ROUTE_ID),
        Some(&json!("B"))
    );
    assert_eq!(received[0].from_route_id(), Some("A"));
    assert!(received[0].exception_caught().is_some());
    assert_eq!(after.received_count(), 0);

    context.stop().await.unwrap();
}

#[tokio::test]
async fn default_handler_redelivers_then_surfaces_the_failure() {
    let registry = Arc::new(Registry::new());
    registry.bind("twice", no_delay(2));
    let context = EipContext::builder()
        .registry(registry)
        .error_handler(
            ErrorHandlerDefinition::builder()
                .redelivery_policy_ref("twice")
                .build(),
        )
        .build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("flaky")
                .from("direct:flaky")
                .steps(vec![StepDefinition::to("mock:flaky")])
                .build(),
        )
        .unwrap();
    context
        .add_route(
            RouteDefinition::builder()
                .id("broken")
                .from("direct:broken")
                .steps(vec![StepDefinition::to("mock:broken")])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let flaky = context.mock_endpoint("mock:flaky").unwrap();
    flaky.when_exchange_received(0, fail_with(|| anyhow::anyhow!("first")));
    flaky.when_exchange_received(1, fail_with(|| anyhow::anyhow!("second")));
    flaky.when_exchange_received(
        2,
        processor_fn(|ex| {
            ex.set_body("ok");
            Ok(())
        }),
    );
    let broken = context.mock_endpoint("mock:broken").unwrap();
    broken.when_any_exchange_received(fail_with(|| anyhow::anyhow!("always")));

    let template = context.create_producer_template();
    assert_eq!(template.request_body("direct:flaky", "x").await.unwrap(), json!("ok"));
    let last = flaky.received_exchanges().pop().unwrap();
    assert_eq!(last.header(header::REDELIVERY_COUNTER), Some(&json!(2)));

    let err = template.request_body("direct:broken", "x").await.unwrap_err();
    match err {
        RuntimeError::Eip(EipError::ExchangeFailed { failure, .. }) => {
            assert_eq!(failure.to_string(), "always");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broken.received_count(), 3);

    let returned = template
        .send("direct:broken", Exchange::with_body("y"))
        .await
        .unwrap();
    assert!(returned.is_failed());
    assert_eq!(returned.error_handler_handled(), Some(false));

    context.stop().await.unwrap();
}

#[tokio::test]
async fn on_exception_handles_by_type_before_catch_all() {
    let context = EipContext::builder()
        .on_exceptions(vec![
            OnExceptionDefinition::builder()
                .exceptions(vec![ExceptionMatcher::any()])
                .handled(true)
                .steps(vec![StepDefinition::set_body(expression::constant("generic"))])
                .build(),
        ])
        .build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("orders")
                .from("direct:orders")
                .on_exceptions(vec![
                    OnExceptionDefinition::builder()
                        .exceptions(vec![ExceptionMatcher::of::<InvalidOrder>()])
                        .handled(true)
                        .steps(vec![
                            StepDefinition::set_body(expression::constant("rejected")),
                            StepDefinition::to("mock:rejected"),
                        ])
                        .build(),
                ])
                .steps(vec![
                    StepDefinition::filter(
                        predicate::body_equals("bad"),
                        vec![StepDefinition::process(fail_with(|| InvalidOrder.into()))],
                    ),
                    StepDefinition::process(fail_with(|| anyhow::anyhow!("other"))),
                ])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    assert_eq!(
        template.request_body("direct:orders", "bad").await.unwrap(),
        json!("rejected")
    );
    assert_eq!(
        template.request_body("direct:orders", "good").await.unwrap(),
        json!("generic")
    );
    let rejected = context.mock_endpoint("mock:rejected").unwrap();
    assert_eq!(rejected.received_count(), 1);

    context.stop().await.unwrap();
}

#[tokio::test]
async fn multicast_branches_can_opt_out_of_the_error_handler() {
    async fn run(inherit: bool) -> (usize, usize) {
        let ok = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicUsize::new(0));
        let context = EipContext::builder()
            .error_handler(
                ErrorHandlerDefinition::builder()
                    .redelivery_policy(no_delay(2))
                    .build(),
            )
            .build();
        context
            .add_route(
                RouteDefinition::builder()
                    .id("fanout")
                    .from("direct:fanout")
                    .steps(vec![
                        MulticastDefinition::builder()
                            .outputs(vec![
                                vec![StepDefinition::process(counting(ok.clone(), false))],
                                vec![StepDefinition::process(counting(failing.clone(), true))],
                            ])
                            .inherit_error_handler(inherit)
                            .build()
                            .into(),
                    ])
                    .build(),
            )
            .unwrap();
        context.start().await.unwrap();
        let result = context
            .create_producer_template()
            .send_body("direct:fanout", "x")
            .await;
        assert!(result.is_err());
        context.stop().await.unwrap();
        (ok.load(Ordering::SeqCst), failing.load(Ordering::SeqCst))
    }

    // 分支自带错误处理器：只重投失败的分支
    assert_eq!(run(true).await, (1, 3));
    // 不继承：失败交给多播外层的错误处理器，整个多播重投
    assert_eq!(run(false).await, (3, 3));
}

#[tokio::test]
async fn choice_and_loop_steps_compose() {
    let context = EipContext::default();
    context
        .add_route(
            RouteDefinition::builder()
                .id("router")
                .from("direct:router")
                .steps(vec![
                    ChoiceDefinition::new()
                        .when(
                            predicate::header_equals("kind", "gold"),
                            vec![StepDefinition::to("mock:gold")],
                        )
                        .otherwise(vec![
                            LoopDefinition::builder()
                                .count(expression::constant(3))
                                .steps(vec![StepDefinition::to("mock:standard")])
                                .build()
                                .into(),
                        ])
                        .into(),
                    StepDefinition::process(Enrich::shared()),
                    StepDefinition::to("mock:all"),
                ])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let all = context.mock_endpoint("mock:all").unwrap();
    all.expected_message_count(2);
    all.expected_header_received("enriched", true);

    let template = context.create_producer_template();
    template
        .send_body_and_header("direct:router", "a", "kind", "gold")
        .await
        .unwrap();
    template.send_body("direct:router", "b").await.unwrap();

    all.assert_is_satisfied(WAIT).await.unwrap();
    assert_eq!(context.mock_endpoint("mock:gold").unwrap().received_count(), 1);
    assert_eq!(
        context.mock_endpoint("mock:standard").unwrap().received_count(),
        3
    );

    context.stop().await.unwrap();
}

#[tokio::test]
async fn pending_aggregation_groups_complete_on_shutdown() {
    let context = EipContext::default();
    context
        .add_route(
            RouteDefinition::builder()
                .id("batch")
                .from("direct:batch")
                .steps(vec![
                    AggregateDefinition::builder()
                        .correlation(expression::header("key"))
                        .strategy(Arc::new(StringConcatStrategy::new("+")))
                        .completion_size(3)
                        .steps(vec![StepDefinition::to("mock:aggregated")])
                        .build()
                        .into(),
                ])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    for body in ["1", "2"] {
        template
            .send_body_and_header("direct:batch", body, "key", "k")
            .await
            .unwrap();
    }
    let aggregated = context.mock_endpoint("mock:aggregated").unwrap();
    assert_eq!(aggregated.received_count(), 0);

    context.stop().await.unwrap();
    let received = aggregated.received_exchanges();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body(), &json!("1+2"));
    assert_eq!(
        received[0].property(property::AGGREGATED_COMPLETED_BY),
        Some(&json!("force"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_aggregation_groups_complete_on_timeout() {
    let context = EipContext::default();
    context
        .add_route(
            RouteDefinition::builder()
                .id("idle")
                .from("direct:idle")
                .steps(vec![
                    AggregateDefinition::builder()
                        .correlation(expression::header("key"))
                        .strategy(Arc::new(StringConcatStrategy::new("+")))
                        .completion_size(10)
                        .completion_timeout(Duration::from_millis(100))
                        .timeout_checker_interval(Duration::from_millis(20))
                        .steps(vec![StepDefinition::to("mock:idle")])
                        .build()
                        .into(),
                ])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    for body in ["1", "2"] {
        template
            .send_body_and_header("direct:idle", body, "key", "k")
            .await
            .unwrap();
    }
    let idle = context.mock_endpoint("mock:idle").unwrap();
    idle.expected_bodies_received(vec![json!("1+2")]);
    idle.assert_is_satisfied(WAIT).await.unwrap();
    assert_eq!(
        idle.received_exchanges()[0].property(property::AGGREGATED_COMPLETED_BY),
        Some(&json!("timeout"))
    );

    context.stop().await.unwrap();
    assert_eq!(idle.received_count(), 1);
}

#[tokio::test]
async fn invalid_definitions_are_rejected_when_added() {
    let context = EipContext::default();
    let result = context.add_route(
        RouteDefinition::builder()
            .id("spin")
            .from("direct:spin")
            .steps(vec![LoopDefinition::builder().steps(vec![]).build().into()])
            .build(),
    );
    assert!(matches!(
        result,
        Err(RuntimeError::InvalidDefinition { route_id, .. }) if route_id == "spin"
    ));

    let result = context.add_route(
        RouteDefinition::builder()
            .id("clock")
            .from("direct:clock")
            .steps(vec![
                AggregateDefinition::builder()
                    .correlation(expression::constant("all"))
                    .strategy(Arc::new(StringConcatStrategy::new("+")))
                    .completion_timeout(Duration::from_millis(100))
                    .completion_interval(Duration::from_millis(100))
                    .steps(vec![])
                    .build()
                    .into(),
            ])
            .build(),
    );
    assert!(matches!(
        result,
        Err(RuntimeError::InvalidDefinition { route_id, .. }) if route_id == "clock"
    ));

    let result = context.add_route(
        RouteDefinition::builder()
            .id("lookup")
            .from("direct:lookup")
            .steps(vec![StepDefinition::process_ref("missing")])
            .build(),
    );
    assert!(matches!(
        result,
        Err(RuntimeError::Eip(EipError::NoSuchBean { .. }))
    ));
    assert!(context.route_ids().is_empty());
}

#[tokio::test]
async fn pooled_exchanges_are_reused_by_the_template() {
    let config = ContextConfig {
        exchange_pooling: true,
        ..ContextConfig::default()
    };
    let context = EipContext::builder().config(config).build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("echo")
                .from("direct:echo")
                .steps(vec![StepDefinition::set_body(expression::constant("pong"))])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    for _ in 0..3 {
        assert_eq!(template.request_body("direct:echo", "ping").await.unwrap(), json!("pong"));
    }
    let pool = context.exchange_pool().unwrap();
    let stats = pool.stats();
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.released, 3);
    assert_eq!(pool.idle(), 1);

    context.stop().await.unwrap();
}
