//! CRUD orchestration: request validation, read coalescing, and notification
//! fan-out.
//!
//! `CrudService` owns the resource cache and the per-resource subscription
//! state. Reads by id are buffered per resource channel until the channel
//! subscription is live, then drained through the cache, so that by the time
//! a cached value is served the invalidation pipeline is already watching for
//! mutations. Mutations publish the resource channel, per-field messages, and
//! precisely targeted view messages derived from the field delta.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerMessage, InboundGate, InboundRequest};
use crate::cache::{CacheEvent, ResourceCache, ResourceKey};
use crate::channel::{self, ChannelAddr};
use crate::filter::FilterPipeline;
use crate::prelude::*;
use crate::schema::SchemaRegistry;
use crate::store::{StoreAdapter, ViewQuery};
use crate::types::{ChangeMessage, Document, Query, ReadResult, ViewAction, ViewPage};
use crate::views::{self, AffectedView, ViewAnalyzer};
use crate::CrudConfig;

type ReadWaiter = oneshot::Sender<CcResult<Document>>;

/// Per-resource broker subscription state for read-by-id coalescing.
enum ResourceSub {
	/// Broker subscribe in flight; reads buffered until it settles
	Subscribing { buffer: Vec<ReadWaiter> },
	/// Live subscription with its watch task
	Subscribed { watch: JoinHandle<()> },
}

struct Inner {
	config: CrudConfig,
	schema: Arc<SchemaRegistry>,
	store: Arc<dyn StoreAdapter>,
	broker: Arc<dyn Broker>,
	cache: ResourceCache,
	filters: FilterPipeline,
	analyzer: ViewAnalyzer,
	subs: Mutex<HashMap<String, ResourceSub>>,
}

/// The realtime CRUD data layer. Cheap to clone; clones share all state.
///
/// Must be created inside a tokio runtime: cache expiry timers and the cache
/// event pump are spawned tasks.
#[derive(Clone)]
pub struct CrudService {
	inner: Arc<Inner>,
}

impl CrudService {
	pub fn new(
		config: CrudConfig,
		schema: Arc<SchemaRegistry>,
		store: Arc<dyn StoreAdapter>,
		broker: Arc<dyn Broker>,
	) -> Self {
		let cache = ResourceCache::new(config.cache_duration, config.cache_disabled);
		let filters = FilterPipeline::new(
			schema.clone(),
			config.block_pre_by_default,
			config.block_post_by_default,
		);
		let analyzer = ViewAnalyzer::new(schema.clone());
		let service = Self {
			inner: Arc::new(Inner {
				config,
				schema,
				store,
				broker,
				cache,
				filters,
				analyzer,
				subs: Mutex::new(HashMap::new()),
			}),
		};
		service.spawn_cache_pump();
		service
	}

	/// Install this service as the broker's inbound middleware.
	pub fn attach(&self) {
		self.inner.broker.set_gate(Arc::new(self.clone()));
	}

	pub fn cache(&self) -> &ResourceCache {
		&self.inner.cache
	}

	// Validation //
	//************//

	fn validate(&self, query: &Query) -> CcResult<()> {
		if query.r#type.is_empty() {
			return Err(Error::InvalidArguments("query must specify a type".to_string()));
		}
		if !self.inner.schema.has_type(&query.r#type) {
			return Err(Error::InvalidModelType(query.r#type.as_str().into()));
		}
		if query.field.is_some() && query.id.is_none() {
			return Err(Error::InvalidArguments("field queries require an id".to_string()));
		}
		if let Some(view_name) = &query.view {
			let Some(view) = self.inner.schema.view_schema(&query.r#type, view_name) else {
				return Err(Error::InvalidParams(format!(
					"unknown view {} on {}",
					view_name, query.r#type
				)));
			};
			let params = query.view_params.as_ref();
			for key in view.param_fields.iter().chain(view.primary_keys.iter()) {
				let present = params.map(|p| p.contains_key(key.as_str())).unwrap_or(false);
				if !present {
					return Err(Error::InvalidParams(format!("missing view parameter {}", key)));
				}
			}
		}
		Ok(())
	}

	// create //
	//********//

	/// Create a document and notify affected channels. Returns the new id.
	pub async fn create(&self, query: Query) -> CcResult<String> {
		self.validate(&query)?;
		let Some(Value::Object(value)) = query.value else {
			return Err(Error::InvalidParams("create requires an object value".to_string()));
		};
		let model = query.r#type;

		let id = self.inner.store.insert(&model, value.clone()).await?;
		debug!("created {}/{}", model, id);

		let mut resource = value;
		resource.entry("id".to_string()).or_insert_with(|| Value::String(id.clone()));

		self.publish_crud(&channel::resource_channel(&model, &id), None).await;
		for av in self.inner.analyzer.affected_views(&model, &resource, None) {
			let msg = ChangeMessage::view_create(id.clone());
			self.publish_crud(
				&channel::view_channel(&model, &av.view, &av.primary_params),
				Some(msg.to_value()),
			)
			.await;
		}
		Ok(id)
	}

	// read //
	//******//

	/// Read a document by id (optionally a single field of it), or a page of
	/// view ids when no id is given.
	pub async fn read(&self, query: Query, auth_token: Option<&Value>) -> CcResult<ReadResult> {
		self.validate(&query)?;
		match query.id.clone() {
			Some(id) => {
				let field = query.field.clone();
				let resource = self.read_resource(query, id).await?;
				match field {
					Some(field) => {
						Ok(ReadResult::Field(resource.get(&field).cloned().unwrap_or(Value::Null)))
					}
					None => Ok(ReadResult::Document(resource)),
				}
			}
			None => self.read_collection(query, auth_token).await.map(ReadResult::Page),
		}
	}

	/// Read one resource, coalescing with every other reader of the same id.
	///
	/// State machine per resource channel:
	///   Idle        --read-->  Subscribing (buffer caller, subscribe)
	///   Subscribing --read-->  Subscribing (buffer caller)
	///   Subscribing --ok-->    Subscribed  (drain buffer through the cache)
	///   Subscribing --fail-->  Idle        (flush buffer with the error)
	///   Subscribed  --read-->  Subscribed  (straight through the cache)
	async fn read_resource(&self, query: Query, id: String) -> CcResult<Document> {
		let model = query.r#type.clone();
		let chan = channel::resource_channel(&model, &id);

		enum Step {
			Drain,
			Buffered(oneshot::Receiver<CcResult<Document>>),
			Subscribe(oneshot::Receiver<CcResult<Document>>),
		}

		let step = {
			let mut subs = self.inner.subs.lock();
			match subs.get_mut(&chan) {
				Some(ResourceSub::Subscribed { .. }) => Step::Drain,
				Some(ResourceSub::Subscribing { buffer }) => {
					let (tx, rx) = oneshot::channel();
					buffer.push(tx);
					Step::Buffered(rx)
				}
				None => {
					let (tx, rx) = oneshot::channel();
					subs.insert(chan.clone(), ResourceSub::Subscribing { buffer: vec![tx] });
					Step::Subscribe(rx)
				}
			}
		};

		match step {
			Step::Drain => self.fetch_through_cache(&query, &model, &id).await,
			Step::Buffered(rx) => recv_buffered(rx).await,
			Step::Subscribe(rx) => {
				self.clone().spawn_subscribe(query, chan, model, id);
				recv_buffered(rx).await
			}
		}
	}

	/// Route one fetch through the cache. Registration happens at call time,
	/// before the returned future is awaited.
	fn fetch_through_cache(
		&self,
		query: &Query,
		model: &str,
		id: &str,
	) -> impl Future<Output = CcResult<Document>> + Send + 'static {
		let store = self.inner.store.clone();
		let model = model.to_string();
		let id = id.to_string();
		self.inner.cache.pass(query, move || async move {
			match store.fetch(&model, &id).await {
				Ok(Some(doc)) => Ok(doc),
				Ok(None) => Err(Error::NotFound),
				Err(err) => Err(err),
			}
		})
	}

	/// Subscribe to a resource channel, then drain the buffered readers.
	fn spawn_subscribe(self, query: Query, chan: String, model: String, id: String) {
		tokio::spawn(async move {
			match self.inner.broker.subscribe(&chan).await {
				Ok(rx) => {
					let key = ResourceKey { model: model.clone(), id: id.clone() };
					let watch = self.spawn_watch(rx, key);
					let buffer = {
						let mut subs = self.inner.subs.lock();
						match subs.insert(chan.clone(), ResourceSub::Subscribed { watch }) {
							Some(ResourceSub::Subscribing { buffer }) => buffer,
							Some(ResourceSub::Subscribed { watch: stale }) => {
								stale.abort();
								Vec::new()
							}
							None => Vec::new(),
						}
					};

					// Register every buffered reader on the cache before the
					// first await so they all share one fetch, then deliver
					// in enqueue order.
					let mut flights = Vec::with_capacity(buffer.len());
					for waiter in buffer {
						flights.push((waiter, self.fetch_through_cache(&query, &model, &id)));
					}
					for (waiter, flight) in flights {
						let result = flight.await;
						let _ = waiter.send(result);
					}
				}
				Err(err) => {
					warn!("failed to subscribe to {}: {}", chan, err);
					let buffer = match self.inner.subs.lock().remove(&chan) {
						Some(ResourceSub::Subscribing { buffer }) => buffer,
						_ => Vec::new(),
					};
					for waiter in buffer {
						let _ = waiter.send(Err(Error::SubscribeFailed(chan.as_str().into())));
					}
				}
			}
		});
	}

	/// Watch a resource channel: every observed change message clears the
	/// cache entry so the next read refetches.
	fn spawn_watch(&self, mut rx: broadcast::Receiver<BrokerMessage>, key: ResourceKey) -> JoinHandle<()> {
		let cache = self.inner.cache.clone();
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(_) => cache.clear(&key),
					Err(broadcast::error::RecvError::Lagged(_)) => cache.clear(&key),
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		})
	}

	async fn read_collection(&self, query: Query, auth_token: Option<&Value>) -> CcResult<ViewPage> {
		let inner = &self.inner;
		let model = query.r#type.clone();
		let page_size = query.page_size.unwrap_or(inner.config.default_page_size) as u64;
		let offset = query.offset.unwrap_or(0);

		let base = match &query.view {
			Some(view_name) => {
				// Existence checked by validate
				let Some(view) = inner.schema.view_schema(&model, view_name) else {
					return Err(Error::InvalidParams(format!("unknown view {}", view_name)));
				};
				let params = views::sanitize_params(view, query.view_params.as_ref());
				match &view.transform {
					Some(transform) => transform(ViewQuery::new(), &params),
					None => ViewQuery::new(),
				}
			}
			None => ViewQuery::new(),
		};

		// One row past the page decides is_last_page
		let probe = base.clone().with_offset(offset).with_limit(page_size + 1);

		let (ids, count) = if query.get_count.unwrap_or(false) {
			let (ids, count) =
				tokio::join!(inner.store.query_ids(&model, &probe), inner.store.count(&model, &base));
			let count = match count {
				Ok(count) => Some(count),
				Err(err) => {
					// Count failures never block the primary result
					warn!("count on {} failed: {}", model, err);
					None
				}
			};
			(ids?, count)
		} else {
			(inner.store.query_ids(&model, &probe).await?, None)
		};

		inner.filters.post(&query, auth_token, None).await?;

		let mut data = ids;
		let is_last_page = data.len() as u64 <= page_size;
		data.truncate(page_size as usize);
		Ok(ViewPage { data, is_last_page, count })
	}

	// update //
	//********//

	/// Update a document (whole-value merge or a single field) and publish
	/// the resource, field, and view deltas.
	pub async fn update(&self, query: Query) -> CcResult<()> {
		self.validate(&query)?;
		let inner = &self.inner;
		let model = query.r#type.clone();
		let id = query
			.id
			.clone()
			.ok_or_else(|| Error::InvalidParams("update requires an id".to_string()))?;

		let changes: Document = match (&query.field, &query.value) {
			(Some(field), value) => {
				if field == "id" {
					return Err(Error::InvalidOperation(
						"the id field cannot be modified".to_string(),
					));
				}
				let value = value.clone().unwrap_or(Value::Null);
				if value.is_object() {
					return Err(Error::InvalidParams(
						"field updates take a scalar value".to_string(),
					));
				}
				let mut map = Document::new();
				map.insert(field.clone(), value);
				map
			}
			(None, Some(Value::Object(map))) => {
				if let Some(new_id) = map.get("id") {
					if new_id.as_str() != Some(id.as_str()) {
						return Err(Error::InvalidOperation(
							"the id field cannot be modified".to_string(),
						));
					}
				}
				let mut map = map.clone();
				map.remove("id");
				map
			}
			(None, Some(_)) => {
				return Err(Error::InvalidOperation(
					"a document cannot be replaced with a primitive".to_string(),
				))
			}
			(None, None) => {
				return Err(Error::InvalidArguments(
					"update requires a field or a value".to_string(),
				))
			}
		};
		if changes.is_empty() {
			return Ok(());
		}

		let old = inner.store.fetch(&model, &id).await?.ok_or(Error::NotFound)?;
		let changed_fields: Vec<String> = changes.keys().cloned().collect();
		let old_affected = inner.analyzer.affected_views(&model, &old, Some(&changed_fields));

		inner.store.apply(&model, &id, &changes).await?;

		let mut updated = old;
		for (field, value) in &changes {
			updated.insert(field.clone(), value.clone());
		}
		let new_affected = inner.analyzer.affected_views(&model, &updated, Some(&changed_fields));

		self.publish_crud(&channel::resource_channel(&model, &id), None).await;
		for (field, value) in &changes {
			let msg = ChangeMessage::field_update(value.clone());
			self.publish_crud(&channel::field_channel(&model, &id, field), Some(msg.to_value()))
				.await;
		}
		self.publish_view_transitions(&model, &id, &old_affected, &new_affected).await;
		Ok(())
	}

	/// Publish move / remove+add messages for each view whose parameters or
	/// affecting data changed between the old and new document.
	async fn publish_view_transitions(
		&self,
		model: &str,
		id: &str,
		old_affected: &[AffectedView],
		new_affected: &[AffectedView],
	) {
		for old_view in old_affected {
			let Some(new_view) = new_affected.iter().find(|v| v.view == old_view.view) else {
				continue;
			};
			if old_view.params == new_view.params {
				if old_view.affecting_data != new_view.affecting_data {
					let msg = ChangeMessage::view_update(ViewAction::Move, id);
					self.publish_crud(
						&channel::view_channel(model, &new_view.view, &new_view.primary_params),
						Some(msg.to_value()),
					)
					.await;
				}
				// Identical params and affecting data: nothing moved
			} else {
				let remove = ChangeMessage::view_update(ViewAction::Remove, id);
				self.publish_crud(
					&channel::view_channel(model, &old_view.view, &old_view.primary_params),
					Some(remove.to_value()),
				)
				.await;
				let add = ChangeMessage::view_update(ViewAction::Add, id);
				self.publish_crud(
					&channel::view_channel(model, &new_view.view, &new_view.primary_params),
					Some(add.to_value()),
				)
				.await;
			}
		}
	}

	// delete //
	//********//

	/// Delete a document, or a single field of it when `field` is set.
	pub async fn delete(&self, query: Query) -> CcResult<()> {
		self.validate(&query)?;
		let inner = &self.inner;
		let model = query.r#type.clone();
		let id = query
			.id
			.clone()
			.ok_or_else(|| Error::InvalidParams("delete requires an id".to_string()))?;

		let doc = inner.store.fetch(&model, &id).await?.ok_or(Error::NotFound)?;

		if let Some(field) = &query.field {
			if field == "id" {
				return Err(Error::InvalidOperation("the id field cannot be deleted".to_string()));
			}
			inner.store.remove_field(&model, &id, field).await?;
			let msg = ChangeMessage::field_delete();
			self.publish_crud(&channel::field_channel(&model, &id, field), Some(msg.to_value()))
				.await;
			return Ok(());
		}

		let affected = inner.analyzer.affected_views(&model, &doc, None);
		inner.store.remove(&model, &id).await?;
		debug!("deleted {}/{}", model, id);

		// Field channels are enumerated from the schema when it lists
		// fields, falling back to the deleted document's own keys. A field
		// the schema omits but the document had gets no notification.
		let fields: Vec<String> = match inner.schema.fields_of(&model).filter(|f| !f.is_empty()) {
			Some(fields) => fields.to_vec(),
			None => doc.keys().cloned().collect(),
		};
		for field in &fields {
			let msg = ChangeMessage::field_delete();
			self.publish_crud(&channel::field_channel(&model, &id, field), Some(msg.to_value()))
				.await;
		}
		for av in &affected {
			let msg = ChangeMessage::view_delete(id.clone());
			self.publish_crud(
				&channel::view_channel(&model, &av.view, &av.primary_params),
				Some(msg.to_value()),
			)
			.await;
		}
		Ok(())
	}

	// Out-of-band notification hooks //
	//********************************//

	/// An external writer changed a resource; subscribers must refetch.
	pub async fn notify_resource_update(&self, model: &str, id: &str) -> CcResult<()> {
		if !self.inner.schema.has_type(model) {
			return Err(Error::InvalidModelType(model.into()));
		}
		self.publish_crud(&channel::resource_channel(model, id), None).await;
		Ok(())
	}

	/// Publish a message on one view instance channel.
	pub async fn notify_view_update(
		&self,
		model: &str,
		view: &str,
		params: &Map<String, Value>,
		message: ChangeMessage,
	) -> CcResult<()> {
		let Some(view_schema) = self.inner.schema.view_schema(model, view) else {
			return Err(Error::InvalidParams(format!("unknown view {} on {}", view, model)));
		};
		let primary = views::primary_params(view_schema, params);
		self.publish_crud(&channel::view_channel(model, view, &primary), Some(message.to_value()))
			.await;
		Ok(())
	}

	/// An external writer replaced a resource: publish the full delta.
	///
	/// View notifications are coarser than the online update path: one
	/// `{type:"update", id}` per distinct `(view, params)` across both sides,
	/// with no move / remove+add distinction.
	pub async fn notify_update(
		&self,
		model: &str,
		old_resource: &Document,
		new_resource: &Document,
	) -> CcResult<()> {
		if !self.inner.schema.has_type(model) {
			return Err(Error::InvalidModelType(model.into()));
		}
		let modified = views::modified_fields(old_resource, new_resource);
		if modified.is_empty() {
			return Ok(());
		}
		let id = old_resource
			.get("id")
			.or_else(|| new_resource.get("id"))
			.and_then(Value::as_str)
			.ok_or_else(|| Error::InvalidParams("resources must carry an id".to_string()))?
			.to_string();

		self.publish_crud(&channel::resource_channel(model, &id), None).await;
		for field in &modified {
			let value = new_resource.get(field).cloned().unwrap_or(Value::Null);
			let msg = ChangeMessage::field_update(value);
			self.publish_crud(&channel::field_channel(model, &id, field), Some(msg.to_value()))
				.await;
		}

		let old_affected = self.inner.analyzer.affected_views(model, old_resource, Some(&modified));
		let new_affected = self.inner.analyzer.affected_views(model, new_resource, Some(&modified));
		let mut seen: HashSet<(String, String)> = HashSet::new();
		for av in old_affected.iter().chain(new_affected.iter()) {
			let fingerprint =
				(av.view.clone(), channel::canonical_json(&Value::Object(av.params.clone())));
			if !seen.insert(fingerprint) {
				continue;
			}
			let msg = ChangeMessage::view_touch(id.clone());
			self.publish_crud(
				&channel::view_channel(model, &av.view, &av.primary_params),
				Some(msg.to_value()),
			)
			.await;
		}
		Ok(())
	}

	// Internals //
	//***********//

	/// Publish on the broker, mirroring field messages into the local cache
	/// first so a pending fetch of the same resource picks up the patch.
	async fn publish_crud(&self, chan: &str, payload: Option<Value>) {
		if let Some(payload) = &payload {
			self.inner.cache.update(chan, payload);
		}
		if let Err(err) = self.inner.broker.publish(chan, payload).await {
			warn!("publish on {} failed: {}", chan, err);
		}
	}

	/// Listen for cache expiry/clear and tear down the matching resource
	/// channel subscription.
	fn spawn_cache_pump(&self) {
		let mut events = self.inner.cache.events();
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(CacheEvent::Expire { key }) | Ok(CacheEvent::Clear { key }) => {
						let Some(inner) = weak.upgrade() else { break };
						Self::teardown_subscription(&inner, &key).await;
					}
					Ok(_) => {}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!("cache event listener lagged, skipped {} events", n);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
	}

	async fn teardown_subscription(inner: &Arc<Inner>, key: &ResourceKey) {
		let chan = channel::resource_channel(&key.model, &key.id);
		let watch = {
			let mut subs = inner.subs.lock();
			// A subscribe still in flight keeps its buffer untouched
			let live = matches!(subs.get(&chan), Some(ResourceSub::Subscribed { .. }));
			if live {
				match subs.remove(&chan) {
					Some(ResourceSub::Subscribed { watch }) => Some(watch),
					_ => None,
				}
			} else {
				None
			}
		};
		if let Some(watch) = watch {
			watch.abort();
			inner.broker.unsubscribe(&chan).await;
			debug!("resource channel released: {}", chan);
		}
	}
}

async fn recv_buffered(rx: oneshot::Receiver<CcResult<Document>>) -> CcResult<Document> {
	match rx.await {
		Ok(result) => result,
		Err(_) => Err(Error::Store("buffered read was dropped".to_string())),
	}
}

// Broker middleware //
//*******************//

#[async_trait]
impl InboundGate for CrudService {
	async fn allow_emit(&self, req: &InboundRequest) -> CcResult<()> {
		match req.event.as_str() {
			"create" | "read" | "update" | "delete" => {
				let data = req
					.data
					.clone()
					.ok_or_else(|| Error::InvalidArguments("missing query payload".to_string()))?;
				let query: Query = serde_json::from_value(data)?;
				self.validate(&query)?;
				self.inner.filters.pre(&query, req.auth_token.as_ref()).await
			}
			_ if self.inner.config.block_inbound_by_default => Err(Error::Blocked(FilterPhase::Pre)),
			_ => Ok(()),
		}
	}

	async fn allow_publish(&self, req: &InboundRequest) -> CcResult<()> {
		match &req.channel {
			// The server owns publication on crud channels
			Some(chan) if chan.starts_with(channel::CHANNEL_PREFIX) => {
				Err(Error::PublishNotAllowed(chan.as_str().into()))
			}
			_ => Ok(()),
		}
	}

	async fn allow_subscribe(&self, req: &InboundRequest) -> CcResult<()> {
		let Some(chan) = &req.channel else {
			return Ok(());
		};
		// Channels outside the crud namespace are not ours to police
		let Some(addr) = channel::parse(chan) else {
			return Ok(());
		};

		let query = match &addr {
			ChannelAddr::Model { model, id, field } => {
				if !self.inner.schema.has_type(model) {
					return Err(Error::InvalidModelType(model.as_str().into()));
				}
				Query {
					r#type: model.clone(),
					id: id.clone(),
					field: field.clone(),
					..Default::default()
				}
			}
			ChannelAddr::View { model, view, params } => {
				if self.inner.schema.view_schema(model, view).is_none() {
					return Err(Error::InvalidParams(format!(
						"unknown view {} on {}",
						view, model
					)));
				}
				Query {
					r#type: model.clone(),
					view: Some(view.clone()),
					view_params: Some(params.clone()),
					..Default::default()
				}
			}
		};

		self.inner.filters.pre(&query, req.auth_token.as_ref()).await?;
		self.inner
			.filters
			.post_subscribe(&query, req.auth_token.as_ref(), &self.inner.cache, &self.inner.store)
			.await
	}
}

// vim: ts=4
