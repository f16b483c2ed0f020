use eip_core::async_trait;
use eip_core::endpoint::{
    Consumer, Endpoint, EndpointResolver, EndpointUri, Producer, ProducerCache, SharedEndpoint,
    SharedProducer,
};
use eip_core::error::{EipError, EipResult};
use eip_core::exchange::{Exchange, keys::property};
use eip_core::expression::{constant, header};
use eip_core::processor::{
    Processor, RecipientListProcessor, RoutingSlipProcessor, SendProcessor, SharedProcessor,
    processor_fn,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 测试用组件：`test:<name>` 映射到预先登记的处理器
#[derive(Default)]
struct TestComponent {
    targets: HashMap<String, SharedProcessor>,
    created: AtomicUsize,
}

struct TestEndpoint {
    uri: String,
    target: SharedProcessor,
    created: Arc<AtomicUsize>,
}

struct TestProducer {
    uri: String,
    target: SharedProcessor,
}

#[async_trait]
impl Producer for TestProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        self.target.process(exchange).await
    }
}

#[async_trait]
impl Endpoint for TestEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_producer(&self) -> EipResult<SharedProducer> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestProducer {
            uri: self.uri.clone(),
            target: self.target.clone(),
        }))
    }

    async fn create_consumer(&self, _processor: SharedProcessor) -> EipResult<Box<dyn Consumer>> {
        Err(EipError::endpoint(&self.uri, "test endpoints have no consumers"))
    }
}

struct TestResolver {
    component: TestComponent,
    producers_created: Arc<AtomicUsize>,
}

impl EndpointResolver for TestResolver {
    fn resolve(&self, uri: &str) -> EipResult<SharedEndpoint> {
        let parsed = EndpointUri::parse(uri)?;
        let target = self
            .component
            .targets
            .get(parsed.path())
            .filter(|_| parsed.scheme() == "test")
            .cloned()
            .ok_or_else(|| EipError::NoSuchEndpoint {
                uri: uri.to_string(),
            })?;
        self.component.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestEndpoint {
            uri: uri.to_string(),
            target,
            created: self.producers_created.clone(),
        }))
    }
}

fn append(tag: &'static str) -> SharedProcessor {
    processor_fn(move |ex| {
        let body = ex.message().body_as_string();
        ex.set_body(format!("{body}>{tag}"));
        Ok(())
    })
}

fn fixture(cache_size: i32) -> (Arc<ProducerCache>, Arc<AtomicUsize>) {
    let mut component = TestComponent::default();
    component.targets.insert("a".into(), append("a"));
    component.targets.insert("b".into(), append("b"));
    component
        .targets
        .insert("boom".into(), processor_fn(|_| Err(anyhow::anyhow!("boom"))));
    let created = Arc::new(AtomicUsize::new(0));
    let resolver = Arc::new(TestResolver {
        component,
        producers_created: created.clone(),
    });
    (Arc::new(ProducerCache::new(resolver, cache_size)), created)
}

#[tokio::test]
async fn send_records_the_target_endpoint() {
    let (cache, _) = fixture(0);
    let send = SendProcessor::new("test:a", cache);
    let mut ex = Exchange::with_body("x");
    send.process(&mut ex).await.unwrap();
    assert_eq!(ex.body(), &json!("x>a"));
    assert_eq!(ex.property(property::TO_ENDPOINT), Some(&json!("test:a")));
}

#[tokio::test]
async fn routing_slip_chains_hops_and_stops_on_failure() {
    let (cache, _) = fixture(0);
    let slip = RoutingSlipProcessor::builder()
        .expression(header("slip"))
        .producers(cache.clone())
        .build();

    let mut ex = Exchange::with_body("x");
    ex.set_header("slip", "test:a,test:b");
    slip.process(&mut ex).await.unwrap();
    assert_eq!(ex.body(), &json!("x>a>b"));
    assert_eq!(ex.property(property::SLIP_ENDPOINT), Some(&json!("test:b")));

    let mut failing = Exchange::with_body("y");
    failing.set_header("slip", json!(["test:a", "test:boom", "test:b"]));
    slip.process(&mut failing).await.unwrap();
    assert!(failing.is_failed());
    assert_eq!(failing.body(), &json!("y>a"));
}

#[tokio::test]
async fn routing_slip_result_variable_keeps_the_body() {
    let (cache, _) = fixture(0);
    let slip = RoutingSlipProcessor::builder()
        .expression(constant("test:a;test:b"))
        .delimiter(";")
        .producers(cache)
        .result_variable("slipResult")
        .build();
    let mut ex = Exchange::with_body("x");
    slip.process(&mut ex).await.unwrap();
    assert_eq!(ex.body(), &json!("x"));
    assert_eq!(ex.variable("slipResult"), Some(&json!("x>a>b")));
}

#[tokio::test]
async fn recipient_list_ignores_invalid_endpoints_when_asked() {
    let (cache, _) = fixture(0);
    let strict = RecipientListProcessor::builder()
        .expression(constant("test:a,nope:zzz"))
        .producers(cache.clone())
        .build();
    let mut ex = Exchange::with_body("x");
    let err = strict.process(&mut ex).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EipError>(),
        Some(EipError::NoSuchEndpoint { .. })
    ));

    let lenient = RecipientListProcessor::builder()
        .expression(constant("test:a,nope:zzz,test:b"))
        .producers(cache)
        .ignore_invalid_endpoints(true)
        .result_variable("recipients")
        .build();
    let mut ex = Exchange::with_body("x");
    lenient.process(&mut ex).await.unwrap();
    assert_eq!(ex.body(), &json!("x"));
    assert_eq!(ex.variable("recipients"), Some(&json!("x>b")));
}

#[tokio::test]
async fn producer_cache_reuses_evicts_and_can_be_disabled() {
    let (cache, created) = fixture(1);
    cache.acquire("test:a").await.unwrap();
    cache.acquire("test:a").await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    cache.acquire("test:b").await.unwrap();
    assert_eq!(cache.size(), 1);
    cache.acquire("test:a").await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 3);

    let (disabled, created) = fixture(-1);
    assert!(!disabled.is_enabled());
    disabled.acquire("test:a").await.unwrap();
    disabled.acquire("test:a").await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(disabled.size(), 0);
}

#[tokio::test]
async fn recipients_see_correlation_and_index_properties() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut component = TestComponent::default();
    component.targets.insert(
        "spy".into(),
        processor_fn(move |ex| {
            sink.lock().push((
                ex.property(property::CORRELATION_ID).cloned(),
                ex.property(property::MULTICAST_INDEX).cloned(),
                ex.property(property::RECIPIENT_LIST_ENDPOINT).cloned(),
            ));
            Ok(())
        }),
    );
    let resolver = Arc::new(TestResolver {
        component,
        producers_created: Arc::new(AtomicUsize::new(0)),
    });
    let list = RecipientListProcessor::builder()
        .expression(constant(json!(["test:spy", "test:spy?x=1"])))
        .producers(Arc::new(ProducerCache::new(resolver, 0)))
        .build();

    let mut ex = Exchange::with_body("x");
    ex.set_property(property::CORRELATION_ID, "caller");
    list.process(&mut ex).await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (Some(json!("caller")), Some(json!(0)), Some(json!("test:spy"))));
    assert_eq!(seen[1].1, Some(json!(1)));
}
