#![forbid(unsafe_code)]

//! # crudcast
//!
//! A realtime CRUD data layer that sits between many networked clients and a
//! document store. Clients issue create/read/update/delete operations and
//! subscribe to change streams for individual resources, single fields, or
//! named ordered projections ("views") of a model. The layer serializes CRUD
//! intentions against a schema, coalesces concurrent reads through a
//! short-lived single-flight cache, derives affected-view sets from
//! field-level deltas, and publishes precisely targeted change notifications
//! on deterministically named broker channels.
//!
//! The document store and the socket transport stay behind the
//! [`StoreAdapter`] and [`Broker`] traits; [`MemoryStore`] and [`LocalBroker`]
//! are in-process implementations of both.

pub mod broker;
pub mod cache;
pub mod channel;
pub mod crud;
pub mod error;
pub mod filter;
pub mod memory;
pub mod prelude;
pub mod schema;
pub mod store;
pub mod types;
pub mod utils;
pub mod views;

use std::time::Duration;

pub use broker::{Broker, BrokerConfig, BrokerMessage, InboundGate, InboundRequest, LocalBroker};
pub use cache::{CacheEvent, ResourceCache, ResourceKey};
pub use crud::CrudService;
pub use error::{CcResult, Error, FilterPhase};
pub use filter::FilterPipeline;
pub use memory::MemoryStore;
pub use schema::{FilterHook, FnHook, HookRequest, ModelSchema, SchemaRegistry, ViewSchema};
pub use store::{QueryFilter, SortField, StoreAdapter, ViewQuery};
pub use types::{ChangeMessage, Document, Query, ReadResult, ViewAction, ViewPage};
pub use views::{AffectedView, ViewAnalyzer};

/// Tunables for the data layer.
#[derive(Debug, Clone)]
pub struct CrudConfig {
	/// Rows returned by collection reads when the query gives no page size
	pub default_page_size: usize,
	/// TTL for cached single-document reads
	pub cache_duration: Duration,
	/// Bypass the resource cache entirely
	pub cache_disabled: bool,
	/// Deny emits that match no CRUD handler
	pub block_inbound_by_default: bool,
	/// Deny requests on models that declare no pre filter
	pub block_pre_by_default: bool,
	/// Deny subscribes on models that declare no post filter
	pub block_post_by_default: bool,
}

impl Default for CrudConfig {
	fn default() -> Self {
		Self {
			default_page_size: 10,
			cache_duration: Duration::from_millis(10_000),
			cache_disabled: false,
			block_inbound_by_default: false,
			block_pre_by_default: false,
			block_post_by_default: false,
		}
	}
}

// vim: ts=4
