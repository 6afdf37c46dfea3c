//! Two-phase admission pipeline around emits and subscribes.
//!
//! The pre phase is policy-only: it sees the query and the auth token but no
//! resource. The post phase sees the resource; on subscribes it loads the
//! resource itself, through the same cache ordinary reads use.

use serde_json::Value;
use std::sync::Arc;

use crate::cache::ResourceCache;
use crate::prelude::*;
use crate::schema::{HookRequest, SchemaRegistry};
use crate::store::StoreAdapter;
use crate::types::{Document, Query};

#[derive(Clone)]
pub struct FilterPipeline {
	schema: Arc<SchemaRegistry>,
	block_pre_by_default: bool,
	block_post_by_default: bool,
}

impl FilterPipeline {
	pub fn new(
		schema: Arc<SchemaRegistry>,
		block_pre_by_default: bool,
		block_post_by_default: bool,
	) -> Self {
		Self { schema, block_pre_by_default, block_post_by_default }
	}

	/// Pre-phase admission: access control hook, then the model's pre filter.
	pub async fn pre(&self, query: &Query, auth_token: Option<&Value>) -> CcResult<()> {
		let req = HookRequest { query, auth_token, resource: None, phase: FilterPhase::Pre };

		if let Some(hook) = self.schema.access_control_hook(&query.r#type) {
			hook.check(&req).await.map_err(|err| deny(FilterPhase::Pre, err))?;
		}

		match self.schema.filter_hook(&query.r#type, FilterPhase::Pre) {
			Some(hook) => hook.check(&req).await.map_err(|err| deny(FilterPhase::Pre, err)),
			None if self.block_pre_by_default => Err(Error::Blocked(FilterPhase::Pre)),
			None => Ok(()),
		}
	}

	/// Post-phase admission with the resource (if any) in hand.
	pub async fn post(
		&self,
		query: &Query,
		auth_token: Option<&Value>,
		resource: Option<&Document>,
	) -> CcResult<()> {
		let req = HookRequest { query, auth_token, resource, phase: FilterPhase::Post };

		match self.schema.filter_hook(&query.r#type, FilterPhase::Post) {
			Some(hook) => hook.check(&req).await.map_err(|err| deny(FilterPhase::Post, err)),
			None if self.block_post_by_default => Err(Error::Blocked(FilterPhase::Post)),
			None => Ok(()),
		}
	}

	/// Post-phase for subscribes: when the query addresses a resource, load
	/// it first so the hook can inspect it. The load flows through the cache,
	/// coalescing with any concurrent read of the same resource.
	pub async fn post_subscribe(
		&self,
		query: &Query,
		auth_token: Option<&Value>,
		cache: &ResourceCache,
		store: &Arc<dyn StoreAdapter>,
	) -> CcResult<()> {
		let resource = match &query.id {
			Some(id) => {
				let store = store.clone();
				let model = query.r#type.clone();
				let id = id.clone();
				let fetched = cache
					.pass(query, move || async move {
						match store.fetch(&model, &id).await {
							Ok(Some(doc)) => Ok(doc),
							Ok(None) => Err(Error::NotFound),
							Err(err) => Err(err),
						}
					})
					.await?;
				Some(fetched)
			}
			None => None,
		};
		self.post(query, auth_token, resource.as_ref()).await
	}
}

fn deny(phase: FilterPhase, err: Error) -> Error {
	debug!("{} filter denied: {}", phase, err);
	Error::Blocked(phase)
}


// vim: ts=4
