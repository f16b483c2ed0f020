use eip_core::aggregation::StringConcatStrategy;
use eip_core::exchange::Exchange;
use eip_core::executor::WorkerPool;
use eip_core::processor::{MulticastConfig, MulticastProcessor, Processor, SharedProcessor, processor_fn};
use std::sync::Arc;

fn tag(name: &'static str) -> SharedProcessor {
    processor_fn(move |ex| {
        let body = ex.message().body_as_string();
        ex.set_body(format!("{body}:{name}"));
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 内外两层共用一个只有两个工作槽的池
    let pool = WorkerPool::new("shared", 2);
    let config = || {
        MulticastConfig::builder()
            .parallel_processing(true)
            .synchronous(true)
            .aggregation_strategy(Arc::new(StringConcatStrategy::new(", ")))
            .worker_pool(pool.clone())
            .build()
    };

    let warehouses: SharedProcessor = Arc::new(MulticastProcessor::new(
        vec![tag("east"), tag("west")],
        config(),
    ));
    let quote = MulticastProcessor::new(vec![warehouses.clone(), warehouses, tag("drop-ship")], config());

    let mut exchange = Exchange::with_body("sku-42");
    quote.process(&mut exchange).await?;
    println!("quotes: {}", exchange.body());
    println!("pool '{}' free slots: {}", pool.name(), pool.available());
    Ok(())
}
