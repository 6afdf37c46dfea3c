//! Short-TTL single-flight cache for single-document reads.
//!
//! Concurrent reads of the same `(model, id)` coalesce onto one in-flight
//! fetch: the first caller leads and runs the data provider, later callers
//! join its waiter list. Field-level change messages observed while the fetch
//! is pending accumulate in a patch map and are re-applied to the resolved
//! document before any waiter sees it.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{self, ChannelAddr};
use crate::prelude::*;
use crate::types::{ChangeMessage, Document, Query};

/// Identity of a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
	pub model: String,
	pub id: String,
}

impl ResourceKey {
	/// Extract the cache key from a query; `None` when the query does not
	/// address a single resource.
	pub fn from_query(query: &Query) -> Option<Self> {
		if query.r#type.is_empty() {
			return None;
		}
		let id = query.id.as_ref()?;
		Some(Self { model: query.r#type.clone(), id: id.clone() })
	}
}

/// Lifecycle events emitted by the cache. The orchestrator listens for
/// `Expire` and `Clear` to tear down resource channel subscriptions.
#[derive(Debug, Clone)]
pub enum CacheEvent {
	Hit { key: ResourceKey },
	Miss { key: ResourceKey },
	Set { key: ResourceKey },
	Clear { key: ResourceKey },
	Expire { key: ResourceKey },
	Update { key: ResourceKey, field: String },
}

type FetchResult = CcResult<Document>;
type Waiter = oneshot::Sender<FetchResult>;

/// Shared state of an in-flight fetch. Referenced by both the cache entry
/// and the leading caller, so waiters survive entry expiry or clearing
/// mid-flight: the fetch still settles and notifies everyone.
#[derive(Default)]
struct Flight {
	waiters: Mutex<Vec<Waiter>>,
	patch: Mutex<Document>,
}

struct Timer {
	handle: JoinHandle<()>,
	epoch: u64,
}

impl Timer {
	fn cancel(&self) {
		self.handle.abort();
	}
}

enum Entry {
	Pending { flight: Arc<Flight>, timer: Timer },
	Resolved { resource: Document, timer: Timer },
}

impl Entry {
	fn timer(&self) -> &Timer {
		match self {
			Entry::Pending { timer, .. } => timer,
			Entry::Resolved { timer, .. } => timer,
		}
	}
}

/// Outcome of the synchronous registration step of `pass`.
enum Plan {
	/// Caching disabled or key incomplete: run the provider directly
	Direct,
	Hit(Document),
	/// Joined an in-flight fetch
	Wait(oneshot::Receiver<FetchResult>),
	/// This caller runs the provider and settles the flight
	Lead { key: ResourceKey, flight: Arc<Flight> },
}

struct Shared {
	entries: Mutex<HashMap<ResourceKey, Entry>>,
	events: broadcast::Sender<CacheEvent>,
	ttl: Duration,
	disabled: bool,
	epochs: AtomicU64,
}

#[derive(Clone)]
pub struct ResourceCache {
	shared: Arc<Shared>,
}

impl ResourceCache {
	pub fn new(ttl: Duration, disabled: bool) -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			shared: Arc::new(Shared {
				entries: Mutex::new(HashMap::new()),
				events,
				ttl,
				disabled,
				epochs: AtomicU64::new(0),
			}),
		}
	}

	/// Subscribe to cache lifecycle events.
	pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
		self.shared.events.subscribe()
	}

	/// Route a read through the cache.
	///
	/// Registration happens synchronously at call time, before the returned
	/// future is polled: N `pass` calls issued back to back share a single
	/// provider invocation and resolve with the same document or the same
	/// error, with waiters notified in call order.
	pub fn pass<F, Fut>(
		&self,
		query: &Query,
		provider: F,
	) -> impl Future<Output = FetchResult> + Send + 'static
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = FetchResult> + Send + 'static,
	{
		let plan = self.plan(query);
		let shared = self.shared.clone();
		async move {
			match plan {
				Plan::Direct => provider().await,
				Plan::Hit(doc) => Ok(doc),
				Plan::Wait(rx) => match rx.await {
					Ok(result) => result,
					Err(_) => Err(Error::Store("resource fetch was abandoned".to_string())),
				},
				Plan::Lead { key, flight } => {
					let result = provider().await;
					shared.settle(&key, &flight, result)
				}
			}
		}
	}

	fn plan(&self, query: &Query) -> Plan {
		let Some(key) = ResourceKey::from_query(query) else {
			return Plan::Direct;
		};
		if self.shared.disabled {
			return Plan::Direct;
		}

		let mut entries = self.shared.entries.lock();
		match entries.get_mut(&key) {
			Some(Entry::Resolved { resource, timer }) => {
				let doc = resource.clone();
				// Access refreshes the expiry
				let fresh = self.shared.arm_timer(key.clone());
				std::mem::replace(timer, fresh).cancel();
				self.shared.emit(CacheEvent::Hit { key });
				Plan::Hit(doc)
			}
			Some(Entry::Pending { flight, .. }) => {
				let (tx, rx) = oneshot::channel();
				flight.waiters.lock().push(tx);
				self.shared.emit(CacheEvent::Hit { key });
				Plan::Wait(rx)
			}
			None => {
				let flight = Arc::new(Flight::default());
				let timer = self.shared.arm_timer(key.clone());
				entries.insert(key.clone(), Entry::Pending { flight: flight.clone(), timer });
				self.shared.emit(CacheEvent::Miss { key: key.clone() });
				Plan::Lead { key, flight }
			}
		}
	}

	/// Return the cached document for a resolved entry.
	pub fn get(&self, query: &Query) -> Option<Document> {
		let key = ResourceKey::from_query(query)?;
		let entries = self.shared.entries.lock();
		match entries.get(&key) {
			Some(Entry::Resolved { resource, .. }) => Some(resource.clone()),
			_ => None,
		}
	}

	/// Write a resolved entry with a fresh TTL, cancelling any prior timer.
	pub fn set(&self, query: &Query, resource: Document) {
		let Some(key) = ResourceKey::from_query(query) else {
			return;
		};
		if self.shared.disabled {
			return;
		}
		self.shared.install(key, resource);
	}

	/// Remove the entry for a resource. No-op when nothing is cached.
	pub fn clear(&self, key: &ResourceKey) {
		let removed = {
			let mut entries = self.shared.entries.lock();
			entries.remove(key)
		};
		if let Some(entry) = removed {
			entry.timer().cancel();
			debug!("cache clear: {}/{}", key.model, key.id);
			self.shared.emit(CacheEvent::Clear { key: key.clone() });
		}
	}

	/// Apply a field-level change message observed on a broker channel.
	///
	/// Pending entries accumulate the value in their patch map; resolved
	/// entries take the write directly.
	pub fn update(&self, channel_name: &str, message: &Value) {
		let Some(ChannelAddr::Model { model, id: Some(id), field: Some(field) }) =
			channel::parse(channel_name)
		else {
			return;
		};
		let Ok(ChangeMessage::Update { value, .. }) =
			serde_json::from_value::<ChangeMessage>(message.clone())
		else {
			return;
		};
		let value = value.unwrap_or(Value::Null);

		let key = ResourceKey { model, id };
		{
			let mut entries = self.shared.entries.lock();
			match entries.get_mut(&key) {
				Some(Entry::Pending { flight, .. }) => {
					flight.patch.lock().insert(field.clone(), value);
				}
				Some(Entry::Resolved { resource, .. }) => {
					resource.insert(field.clone(), value);
				}
				None => return,
			}
		}
		self.shared.emit(CacheEvent::Update { key, field });
	}
}

impl Shared {
	fn emit(&self, event: CacheEvent) {
		let _ = self.events.send(event);
	}

	fn arm_timer(self: &Arc<Self>, key: ResourceKey) -> Timer {
		let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
		let shared = self.clone();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(shared.ttl).await;
			shared.expire(&key, epoch);
		});
		Timer { handle, epoch }
	}

	fn expire(&self, key: &ResourceKey, epoch: u64) {
		let mut entries = self.entries.lock();
		let current = entries.get(key).map(|e| e.timer().epoch == epoch).unwrap_or(false);
		if current {
			entries.remove(key);
			self.emit(CacheEvent::Expire { key: key.clone() });
		}
	}

	fn install(self: &Arc<Self>, key: ResourceKey, resource: Document) {
		let timer = self.arm_timer(key.clone());
		let mut entries = self.entries.lock();
		if let Some(prev) = entries.insert(key.clone(), Entry::Resolved { resource, timer }) {
			prev.timer().cancel();
		}
		self.emit(CacheEvent::Set { key });
	}

	/// Complete a flight: merge the accumulated patch over the fetched
	/// document (patch wins), cache the merged result, and notify waiters in
	/// enqueue order. Errors are fanned out but never cached.
	fn settle(
		self: &Arc<Self>,
		key: &ResourceKey,
		flight: &Arc<Flight>,
		result: FetchResult,
	) -> FetchResult {
		let mut entries = self.entries.lock();

		let ours = matches!(
			entries.get(key),
			Some(Entry::Pending { flight: current, .. }) if Arc::ptr_eq(current, flight)
		);
		if ours {
			if let Some(entry) = entries.remove(key) {
				entry.timer().cancel();
			}
		}

		let waiters = std::mem::take(&mut *flight.waiters.lock());
		let patch = std::mem::take(&mut *flight.patch.lock());

		let outcome = match result {
			Ok(mut doc) => {
				for (field, value) in patch {
					doc.insert(field, value);
				}
				// A fetch that outlived its entry (expiry or clear mid-flight)
				// installs a fresh one, unless a newer flight took the slot.
				if !entries.contains_key(key) {
					let timer = self.arm_timer(key.clone());
					entries.insert(key.clone(), Entry::Resolved { resource: doc.clone(), timer });
					self.emit(CacheEvent::Set { key: key.clone() });
				}
				Ok(doc)
			}
			Err(err) => Err(err),
		};
		drop(entries);

		for waiter in waiters {
			let _ = waiter.send(outcome.clone());
		}
		outcome
	}
}


// vim: ts=4
