//! Document store interface and query composition types.
//!
//! The core delegates view materialization, document fetch, and counting to a
//! `StoreAdapter`. View transforms compose a `ViewQuery` (filter + sort +
//! page window) which the adapter executes against its backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::prelude::*;
use crate::types::Document;

/// Query filter for selecting documents.
///
/// A document matches if ALL specified conditions are satisfied (AND logic).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
	/// Field equality constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub equals: HashMap<String, Value>,

	/// Field not-equal constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "notEquals")]
	pub not_equals: HashMap<String, Value>,

	/// Field greater-than constraints: field_name -> threshold_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "greaterThan")]
	pub greater_than: HashMap<String, Value>,

	/// Field less-than constraints: field_name -> threshold_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "lessThan")]
	pub less_than: HashMap<String, Value>,

	/// Field in-array constraints: field_name -> array of allowed values
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "inArray")]
	pub in_array: HashMap<String, Vec<Value>>,

	/// Array-contains constraints: field_name -> value that must be in the array field
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "arrayContains")]
	pub array_contains: HashMap<String, Value>,
}

impl QueryFilter {
	/// Create a new empty filter (matches all documents).
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a filter with a single equality constraint.
	pub fn equals_one(field: impl Into<String>, value: Value) -> Self {
		let mut equals = HashMap::new();
		equals.insert(field.into(), value);
		Self { equals, ..Default::default() }
	}

	/// Add an equality constraint to this filter (builder pattern).
	pub fn with_equals(mut self, field: impl Into<String>, value: Value) -> Self {
		self.equals.insert(field.into(), value);
		self
	}

	/// Add a not-equal constraint to this filter (builder pattern).
	pub fn with_not_equals(mut self, field: impl Into<String>, value: Value) -> Self {
		self.not_equals.insert(field.into(), value);
		self
	}

	/// Add a greater-than constraint to this filter (builder pattern).
	pub fn with_greater_than(mut self, field: impl Into<String>, value: Value) -> Self {
		self.greater_than.insert(field.into(), value);
		self
	}

	/// Add a less-than constraint to this filter (builder pattern).
	pub fn with_less_than(mut self, field: impl Into<String>, value: Value) -> Self {
		self.less_than.insert(field.into(), value);
		self
	}

	/// Add an in-array constraint to this filter (builder pattern).
	pub fn with_in_array(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
		self.in_array.insert(field.into(), values);
		self
	}

	/// Add an array-contains constraint to this filter (builder pattern).
	pub fn with_array_contains(mut self, field: impl Into<String>, value: Value) -> Self {
		self.array_contains.insert(field.into(), value);
		self
	}

	/// Check if this filter is empty (matches all documents).
	pub fn is_empty(&self) -> bool {
		self.equals.is_empty()
			&& self.not_equals.is_empty()
			&& self.greater_than.is_empty()
			&& self.less_than.is_empty()
			&& self.in_array.is_empty()
			&& self.array_contains.is_empty()
	}
}

/// Sort order for a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
	pub field: String,

	/// Sort direction: true for ascending, false for descending
	pub ascending: bool,
}

impl SortField {
	pub fn asc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: true }
	}

	pub fn desc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: false }
	}
}

/// A composed collection query: filter, order, and page window.
///
/// View transforms receive a base query and return an enriched one; the
/// orchestrator then applies the page window before execution.
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
	pub filter: Option<QueryFilter>,
	pub sort: Option<Vec<SortField>>,
	pub offset: Option<u64>,
	pub limit: Option<u64>,
}

impl ViewQuery {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_filter(mut self, filter: QueryFilter) -> Self {
		self.filter = Some(filter);
		self
	}

	pub fn with_sort(mut self, sort: Vec<SortField>) -> Self {
		self.sort = Some(sort);
		self
	}

	pub fn with_offset(mut self, offset: u64) -> Self {
		self.offset = Some(offset);
		self
	}

	pub fn with_limit(mut self, limit: u64) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Check if a document matches a filter.
pub fn matches_filter(doc: &Document, filter: &QueryFilter) -> bool {
	for (field, expected) in &filter.equals {
		match doc.get(field) {
			Some(actual) if actual == expected => continue,
			_ => return false,
		}
	}

	// Missing fields are inherently "not equal"
	for (field, expected) in &filter.not_equals {
		match doc.get(field) {
			Some(actual) if actual == expected => return false,
			_ => continue,
		}
	}

	for (field, threshold) in &filter.greater_than {
		match doc.get(field) {
			Some(actual) if compare_values(Some(actual), Some(threshold)) == Ordering::Greater => {
				continue
			}
			_ => return false,
		}
	}

	for (field, threshold) in &filter.less_than {
		match doc.get(field) {
			Some(actual) if compare_values(Some(actual), Some(threshold)) == Ordering::Less => {
				continue
			}
			_ => return false,
		}
	}

	for (field, allowed_values) in &filter.in_array {
		match doc.get(field) {
			Some(actual) if allowed_values.contains(actual) => continue,
			_ => return false,
		}
	}

	for (field, required_value) in &filter.array_contains {
		match doc.get(field) {
			Some(Value::Array(arr)) if arr.contains(required_value) => continue,
			_ => return false,
		}
	}

	true
}

/// Compare two JSON values for sorting.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	match (a, b) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(Value::Number(a)), Some(Value::Number(b))) => {
			a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
		(Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
		(Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
	}
}

/// Compare two documents against a multi-key sort order.
pub fn compare_documents(a: &Document, b: &Document, sort_fields: &[SortField]) -> Ordering {
	for field in sort_fields {
		let ord = compare_values(a.get(&field.field), b.get(&field.field));
		let ord = if field.ascending { ord } else { ord.reverse() };
		if ord != Ordering::Equal {
			return ord;
		}
	}
	Ordering::Equal
}

/// Document store interface consumed by the data layer.
#[async_trait]
pub trait StoreAdapter: Debug + Send + Sync {
	/// Fetch a single document. Returns None when it does not exist.
	async fn fetch(&self, model: &str, id: &str) -> CcResult<Option<Document>>;

	/// Insert a new document; returns its id (generated when the value
	/// carries none).
	async fn insert(&self, model: &str, value: Document) -> CcResult<String>;

	/// Merge the given fields into an existing document.
	async fn apply(&self, model: &str, id: &str, changes: &Document) -> CcResult<()>;

	/// Delete a document.
	async fn remove(&self, model: &str, id: &str) -> CcResult<()>;

	/// Delete a single field from a document.
	async fn remove_field(&self, model: &str, id: &str, field: &str) -> CcResult<()>;

	/// Execute a composed collection query, returning matching ids in order.
	async fn query_ids(&self, model: &str, query: &ViewQuery) -> CcResult<Vec<String>>;

	/// Count documents matching the query's filter.
	async fn count(&self, model: &str, query: &ViewQuery) -> CcResult<u64>;
}


// vim: ts=4
