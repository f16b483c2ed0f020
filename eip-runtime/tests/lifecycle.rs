use async_trait::async_trait;
use eip_core::error::EipError;
use eip_core::errorhandler::RedeliveryPolicy;
use eip_core::exchange::Exchange;
use eip_core::expression;
use eip_core::processor::{Processor, SharedProcessor, processor_fn};
use eip_runtime::config::{ContextConfig, ShutdownConfig};
use eip_runtime::model::{
    ErrorHandlerDefinition, RouteDefinition, ShutdownRoute, ShutdownRunningTask, StepDefinition,
};
use eip_runtime::policy::{CountingRoutePolicy, FlipRoutePolicy, SharedRoutePolicy};
use eip_runtime::route::RouteStatus;
use eip_runtime::{EipContext, RuntimeError};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn fast_shutdown(timeout_ms: u64) -> ContextConfig {
    ContextConfig {
        shutdown: ShutdownConfig {
            timeout_ms,
            poll_interval_ms: 5,
            ..ShutdownConfig::default()
        },
        ..ContextConfig::default()
    }
}

fn simple_route(id: &str, order: Option<u32>) -> RouteDefinition {
    RouteDefinition::builder()
        .id(id)
        .from(format!("direct:{id}"))
        .steps(vec![StepDefinition::to(format!("mock:{id}"))])
        .maybe_startup_order(order)
        .build()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// 记录并发度的慢处理器
struct Slow {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Processor for Slow {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        let n = exchange.body().as_i64().unwrap_or_default();
        exchange.set_body(n * 2);
        Ok(())
    }
}

#[tokio::test]
async fn duplicate_startup_order_fails_naming_both_routes() {
    let context = EipContext::default();
    context.add_route(simple_route("first", Some(5))).unwrap();
    context.add_route(simple_route("second", Some(5))).unwrap();

    let err = context.start().await.unwrap_err();
    match &err {
        RuntimeError::StartupOrderClash {
            order,
            first,
            second,
        } => {
            assert_eq!(*order, 5);
            assert_eq!(first, "first");
            assert_eq!(second, "second");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("startup order 5"));
    assert_eq!(context.route_status("first"), Some(RouteStatus::Stopped));
}

#[tokio::test]
async fn failed_start_rolls_back_routes_already_started() {
    let context = EipContext::default();
    let shared = |id: &str, order| {
        RouteDefinition::builder()
            .id(id)
            .from("direct:shared")
            .steps(vec![StepDefinition::to(format!("mock:{id}"))])
            .startup_order(order)
            .build()
    };
    context.add_route(shared("early", 1)).unwrap();
    context.add_route(shared("late", 2)).unwrap();

    let err = context.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Eip(EipError::Endpoint { .. })));
    assert_eq!(context.route_status("early"), Some(RouteStatus::Stopped));
    assert_eq!(context.route_status("late"), Some(RouteStatus::Stopped));

    // 回滚释放了 direct 消费者槽位
    context.start_route("late").await.unwrap();
    assert_eq!(context.route_status("late"), Some(RouteStatus::Started));
}

#[tokio::test]
async fn routes_stop_in_reverse_order_with_deferred_last() {
    let events = Arc::new(CountingRoutePolicy::new());
    let policy: SharedRoutePolicy = events.clone();
    let context = EipContext::builder().config(fast_shutdown(1_000)).build();
    for (id, order, defer) in [("r3", 3, true), ("r1", 1, false), ("r4", 4, false), ("r2", 2, false)] {
        context
            .add_route(
                RouteDefinition::builder()
                    .id(id)
                    .from(format!("direct:{id}"))
                    .steps(vec![StepDefinition::to("mock:sink")])
                    .startup_order(order)
                    .route_policies(vec![policy.clone()])
                    .shutdown_route(if defer {
                        ShutdownRoute::Defer
                    } else {
                        ShutdownRoute::Default
                    })
                    .build(),
            )
            .unwrap();
    }

    context.start().await.unwrap();
    assert!(context.stop().await.unwrap());

    let starts: Vec<String> = events
        .events()
        .into_iter()
        .filter(|e| e.starts_with("start:"))
        .collect();
    assert_eq!(starts, ["start:r1", "start:r2", "start:r3", "start:r4"]);
    let stops: Vec<String> = events
        .events()
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, ["stop:r4", "stop:r2", "stop:r1", "stop:r3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flip_policy_hands_over_between_routes() {
    let flip: SharedRoutePolicy = Arc::new(FlipRoutePolicy::new("foo", "bar"));
    let context = EipContext::builder().config(fast_shutdown(1_000)).build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("foo")
                .from("direct:foo")
                .steps(vec![StepDefinition::to("mock:foo")])
                .route_policies(vec![flip.clone()])
                .build(),
        )
        .unwrap();
    context
        .add_route(
            RouteDefinition::builder()
                .id("bar")
                .from("direct:bar")
                .steps(vec![StepDefinition::to("mock:bar")])
                .auto_startup(false)
                .route_policies(vec![flip])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();
    assert_eq!(context.route_status("bar"), Some(RouteStatus::Stopped));

    let template = context.create_producer_template();
    template.send_body("direct:foo", "one").await.unwrap();
    assert!(wait_for(|| context.route_status("bar") == Some(RouteStatus::Started)).await);
    assert_eq!(context.route_status("foo"), Some(RouteStatus::Stopped));

    let err = template.send_body("direct:foo", "lost").await.unwrap_err();
    match err {
        RuntimeError::Eip(EipError::ExchangeFailed { failure, .. }) => {
            assert!(matches!(
                failure.downcast_ref::<EipError>(),
                Some(EipError::NoConsumers { .. })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }

    template.send_body("direct:bar", "two").await.unwrap();
    assert!(wait_for(|| context.route_status("foo") == Some(RouteStatus::Started)).await);
    assert_eq!(
        context.mock_endpoint("mock:foo").unwrap().received_bodies(),
        vec![json!("one")]
    );
    assert_eq!(
        context.mock_endpoint("mock:bar").unwrap().received_bodies(),
        vec![json!("two")]
    );

    context.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counting_policy_stops_its_route_after_the_limit() {
    let counter = Arc::new(CountingRoutePolicy::stop_after(2));
    let policy: SharedRoutePolicy = counter.clone();
    let context = EipContext::builder().config(fast_shutdown(1_000)).build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("limited")
                .from("seda:limited")
                .steps(vec![StepDefinition::to("mock:limited")])
                .route_policies(vec![policy])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    template.send_body("seda:limited", 1).await.unwrap();
    template.send_body("seda:limited", 2).await.unwrap();

    assert!(wait_for(|| context.route_status("limited") == Some(RouteStatus::Stopped)).await);
    assert_eq!(counter.completed(), 2);
    assert_eq!(counter.failed(), 0);
    assert_eq!(
        context.mock_endpoint("mock:limited").unwrap().received_count(),
        2
    );

    context.start_route("limited").await.unwrap();
    assert_eq!(context.route_status("limited"), Some(RouteStatus::Started));
    context.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seda_request_reply_with_concurrent_consumers() {
    let slow = Arc::new(Slow {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let processor: SharedProcessor = slow.clone();
    let context = EipContext::builder().config(fast_shutdown(2_000)).build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("calc")
                .from("seda:calc?concurrentConsumers=4")
                .steps(vec![StepDefinition::process(processor)])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    let (a, b, c, d) = tokio::join!(
        template.request_body("seda:calc", 1),
        template.request_body("seda:calc", 2),
        template.request_body("seda:calc", 3),
        template.request_body("seda:calc", 4),
    );
    assert_eq!(
        [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()],
        [json!(2), json!(4), json!(6), json!(8)]
    );
    assert!(slow.peak.load(Ordering::SeqCst) >= 2);

    context.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complete_all_tasks_drains_the_queue_before_stopping() {
    let context = EipContext::builder().config(fast_shutdown(5_000)).build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("drain")
                .from("seda:drain")
                .steps(vec![
                    StepDefinition::delay(expression::constant(20)),
                    StepDefinition::to("mock:drained"),
                ])
                .shutdown_running_task(ShutdownRunningTask::CompleteAllTasks)
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    let template = context.create_producer_template();
    for n in 0..5 {
        template.send_body("seda:drain", n).await.unwrap();
    }
    assert!(context.stop().await.unwrap());
    assert_eq!(
        context.mock_endpoint("mock:drained").unwrap().received_bodies(),
        vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_timeout_interrupts_redelivery_without_dead_letter() {
    let calls = Arc::new(AtomicUsize::new(0));
    let attempts = calls.clone();
    let context = EipContext::builder()
        .config(fast_shutdown(200))
        .error_handler(
            ErrorHandlerDefinition::builder()
                .kind(eip_runtime::model::ErrorHandlerKind::DeadLetterChannel(
                    "mock:dead".to_string(),
                ))
                .redelivery_policy(
                    RedeliveryPolicy::builder()
                        .maximum_redeliveries(5)
                        .redelivery_delay(10_000)
                        .build(),
                )
                .build(),
        )
        .build();
    context
        .add_route(
            RouteDefinition::builder()
                .id("retry")
                .from("seda:retry")
                .steps(vec![StepDefinition::process(processor_fn(move |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("unavailable")
                }))])
                .build(),
        )
        .unwrap();
    context.start().await.unwrap();

    context
        .create_producer_template()
        .send_body("seda:retry", "job")
        .await
        .unwrap();
    assert!(wait_for(|| context.route_inflight("retry") == Some(1)).await);
    assert!(wait_for(|| calls.load(Ordering::SeqCst) == 1).await);

    let started = Instant::now();
    let graceful = context.stop().await.unwrap();
    assert!(!graceful);
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(wait_for(|| context.route_inflight("retry") == Some(0)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(context.mock_endpoint("mock:dead").unwrap().received_count(), 0);
}

#[tokio::test]
async fn routes_added_after_start_need_an_explicit_start() {
    let context = EipContext::default();
    context.add_route(simple_route("early", None)).unwrap();
    context.start().await.unwrap();

    context.add_route(simple_route("late", None)).unwrap();
    assert_eq!(context.route_status("late"), Some(RouteStatus::Stopped));
    context.start_route("late").await.unwrap();
    assert_eq!(context.route_status("late"), Some(RouteStatus::Started));
    assert_eq!(context.startup_order("late"), Some(1001));

    assert!(matches!(
        context.remove_route("late"),
        Err(RuntimeError::InvalidState(_))
    ));
    context.stop_route("late").await.unwrap();
    context.remove_route("late").unwrap();
    assert_eq!(context.route_ids(), vec!["early".to_string()]);
    assert!(matches!(
        context.start_route("late").await,
        Err(RuntimeError::UnknownRoute(_))
    ));

    context.stop().await.unwrap();
}
