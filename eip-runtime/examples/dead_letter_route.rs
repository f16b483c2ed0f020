use eip_core::errorhandler::RedeliveryPolicy;
use eip_core::exchange::keys::{header, property};
use eip_core::processor::processor_fn;
use eip_runtime::EipContext;
use eip_runtime::model::{ErrorHandlerDefinition, ErrorHandlerKind, RouteDefinition, StepDefinition};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let context = EipContext::builder()
        .error_handler(
            ErrorHandlerDefinition::builder()
                .kind(ErrorHandlerKind::DeadLetterChannel("mock:dead".to_string()))
                .redelivery_policy(
                    RedeliveryPolicy::builder()
                        .maximum_redeliveries(2)
                        .redelivery_delay(50)
                        .build(),
                )
                .build(),
        )
        .build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    context.add_route(
        RouteDefinition::builder()
            .id("orders")
            .from("direct:orders")
            .steps(vec![
                StepDefinition::to("direct:billing"),
                StepDefinition::to("mock:shipped"),
            ])
            .build(),
    )?;
    context.add_route(
        RouteDefinition::builder()
            .id("billing")
            .from("direct:billing")
            .steps(vec![StepDefinition::process(processor_fn(move |ex| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                println!(
                    "billing attempt {attempt}, redelivery counter={:?}",
                    ex.header(header::REDELIVERY_COUNTER)
                );
                anyhow::bail!("payment gateway unavailable")
            }))])
            .build(),
    )?;
    context.start().await?;

    context
        .create_producer_template()
        .send_body("direct:orders", "order-1")
        .await?;

    let dead = context.mock_endpoint("mock:dead")?;
    dead.expected_message_count(1);
    dead.assert_is_satisfied(Duration::from_secs(2)).await?;
    for exchange in dead.received_exchanges() {
        println!(
            "dead letter: body={} failure_route={:?} from_route={:?}",
            exchange.body(),
            exchange.property(property::FAILURE_ROUTE_ID),
            exchange.from_route_id()
        );
    }
    println!(
        "billing attempts={}, shipped={}",
        attempts.load(Ordering::SeqCst),
        context.mock_endpoint("mock:shipped")?.received_count()
    );

    context.stop().await?;
    Ok(())
}
