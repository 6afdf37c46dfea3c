//! In-memory document store.
//!
//! The default `StoreAdapter` for tests and small deployments: tables held in
//! a process-local map, queries executed by scan + sort + slice.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::prelude::*;
use crate::store::{compare_documents, matches_filter, StoreAdapter, ViewQuery};
use crate::types::Document;
use crate::utils;

#[derive(Debug, Default)]
pub struct MemoryStore {
	tables: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Number of documents in one model's table.
	pub fn len(&self, model: &str) -> usize {
		self.tables.read().get(model).map(|t| t.len()).unwrap_or(0)
	}

	pub fn is_empty(&self, model: &str) -> bool {
		self.len(model) == 0
	}
}

#[async_trait]
impl StoreAdapter for MemoryStore {
	async fn fetch(&self, model: &str, id: &str) -> CcResult<Option<Document>> {
		let tables = self.tables.read();
		Ok(tables.get(model).and_then(|t| t.get(id)).cloned())
	}

	async fn insert(&self, model: &str, mut value: Document) -> CcResult<String> {
		let id = match value.get("id").and_then(Value::as_str) {
			Some(id) => id.to_string(),
			None => utils::random_id(),
		};
		value.insert("id".to_string(), Value::String(id.clone()));

		let mut tables = self.tables.write();
		let table = tables.entry(model.to_string()).or_default();
		if table.contains_key(&id) {
			return Err(Error::InvalidOperation(format!("document {} already exists", id)));
		}
		table.insert(id.clone(), value);
		Ok(id)
	}

	async fn apply(&self, model: &str, id: &str, changes: &Document) -> CcResult<()> {
		let mut tables = self.tables.write();
		let doc = tables
			.get_mut(model)
			.and_then(|t| t.get_mut(id))
			.ok_or(Error::NotFound)?;
		for (field, value) in changes {
			doc.insert(field.clone(), value.clone());
		}
		Ok(())
	}

	async fn remove(&self, model: &str, id: &str) -> CcResult<()> {
		let mut tables = self.tables.write();
		tables
			.get_mut(model)
			.and_then(|t| t.remove(id))
			.map(|_| ())
			.ok_or(Error::NotFound)
	}

	async fn remove_field(&self, model: &str, id: &str, field: &str) -> CcResult<()> {
		let mut tables = self.tables.write();
		let doc = tables
			.get_mut(model)
			.and_then(|t| t.get_mut(id))
			.ok_or(Error::NotFound)?;
		doc.remove(field);
		Ok(())
	}

	async fn query_ids(&self, model: &str, query: &ViewQuery) -> CcResult<Vec<String>> {
		let tables = self.tables.read();
		let Some(table) = tables.get(model) else {
			return Ok(Vec::new());
		};

		let mut docs: Vec<&Document> = table
			.values()
			.filter(|doc| query.filter.as_ref().map(|f| matches_filter(doc, f)).unwrap_or(true))
			.collect();

		if let Some(sort) = &query.sort {
			docs.sort_by(|a, b| compare_documents(a, b, sort));
		}

		let start = query.offset.unwrap_or(0) as usize;
		if start >= docs.len() {
			return Ok(Vec::new());
		}
		let end = query.limit.map(|l| (start + l as usize).min(docs.len())).unwrap_or(docs.len());

		Ok(docs[start..end]
			.iter()
			.filter_map(|doc| doc.get("id").and_then(Value::as_str).map(str::to_string))
			.collect())
	}

	async fn count(&self, model: &str, query: &ViewQuery) -> CcResult<u64> {
		let tables = self.tables.read();
		let Some(table) = tables.get(model) else {
			return Ok(0);
		};
		let count = table
			.values()
			.filter(|doc| query.filter.as_ref().map(|f| matches_filter(doc, f)).unwrap_or(true))
			.count();
		Ok(count as u64)
	}
}


// vim: ts=4
