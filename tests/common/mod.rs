//! Shared fixtures for integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crudcast::{
	BrokerMessage, CcResult, CrudConfig, CrudService, Document, LocalBroker, MemoryStore,
	ModelSchema, QueryFilter, ReadResult, SchemaRegistry, SortField, StoreAdapter, ViewPage,
	ViewQuery, ViewSchema,
};

pub fn setup_test_logging() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_max_level(tracing::Level::DEBUG)
		.try_init();
}

/// Store wrapper counting document fetches, with a small artificial latency
/// so coalescing windows actually overlap.
#[derive(Debug)]
pub struct CountingStore {
	inner: Arc<MemoryStore>,
	fetches: AtomicUsize,
	fetch_delay: Duration,
}

impl CountingStore {
	pub fn new(fetch_delay: Duration) -> Arc<Self> {
		Arc::new(Self { inner: MemoryStore::new(), fetches: AtomicUsize::new(0), fetch_delay })
	}

	pub fn fetch_count(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}

	pub fn is_empty(&self, model: &str) -> bool {
		self.inner.is_empty(model)
	}
}

#[async_trait]
impl StoreAdapter for CountingStore {
	async fn fetch(&self, model: &str, id: &str) -> CcResult<Option<Document>> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		tokio::time::sleep(self.fetch_delay).await;
		self.inner.fetch(model, id).await
	}

	async fn insert(&self, model: &str, value: Document) -> CcResult<String> {
		self.inner.insert(model, value).await
	}

	async fn apply(&self, model: &str, id: &str, changes: &Document) -> CcResult<()> {
		self.inner.apply(model, id, changes).await
	}

	async fn remove(&self, model: &str, id: &str) -> CcResult<()> {
		self.inner.remove(model, id).await
	}

	async fn remove_field(&self, model: &str, id: &str, field: &str) -> CcResult<()> {
		self.inner.remove_field(model, id, field).await
	}

	async fn query_ids(&self, model: &str, query: &ViewQuery) -> CcResult<Vec<String>> {
		self.inner.query_ids(model, query).await
	}

	async fn count(&self, model: &str, query: &ViewQuery) -> CcResult<u64> {
		self.inner.count(model, query).await
	}
}

/// The Product schema used across scenarios: one `byCat` view parameterized
/// by category, ordered by name, with price as an affecting field.
pub fn product_schema() -> Arc<SchemaRegistry> {
	let by_cat = ViewSchema::new(&["categoryId"]).with_affecting(&["price"]).with_transform(
		|query, params| {
			let category = params.get("categoryId").cloned().unwrap_or(Value::Null);
			query
				.with_filter(QueryFilter::equals_one("categoryId", category))
				.with_sort(vec![SortField::asc("name")])
		},
	);
	let product =
		ModelSchema::new(&["id", "name", "categoryId", "price"]).with_view("byCat", by_cat);
	Arc::new(SchemaRegistry::new(HashMap::from([("Product".to_string(), product)])))
}

pub struct TestRig {
	pub service: CrudService,
	pub broker: Arc<LocalBroker>,
	pub store: Arc<CountingStore>,
}

pub fn rig() -> TestRig {
	rig_with(CrudConfig::default(), product_schema())
}

pub fn rig_with(config: CrudConfig, schema: Arc<SchemaRegistry>) -> TestRig {
	setup_test_logging();
	let broker = LocalBroker::new();
	let store = CountingStore::new(Duration::from_millis(10));
	let service = CrudService::new(config, schema, store.clone(), broker.clone());
	service.attach();
	TestRig { service, broker, store }
}

pub async fn recv_msg(rx: &mut tokio::sync::broadcast::Receiver<BrokerMessage>) -> BrokerMessage {
	tokio::time::timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("timed out waiting for a broker message")
		.expect("broker channel closed")
}

pub fn unwrap_doc(result: ReadResult) -> Document {
	match result {
		ReadResult::Document(doc) => doc,
		other => panic!("expected a document, got {:?}", other),
	}
}

pub fn unwrap_page(result: ReadResult) -> ViewPage {
	match result {
		ReadResult::Page(page) => page,
		other => panic!("expected a page, got {:?}", other),
	}
}
