//! Affected-view analysis for mutation deltas.
//!
//! Given the set of fields a mutation touched, decides which declared views
//! of the model may have changed membership or ordering, and extracts the
//! parameter values that name each affected view instance.

use itertools::Itertools;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::schema::{SchemaRegistry, ViewSchema};
use crate::types::Document;

/// A view instance touched by a mutation.
#[derive(Debug, Clone)]
pub struct AffectedView {
	pub view: String,
	pub model: String,
	/// Values of every param field, read from the resource (absent reads as
	/// null). Equality of `params` across old/new decides move vs remove+add.
	pub params: Map<String, Value>,
	/// Subset of `params` that names the subscribable view instance.
	pub primary_params: Map<String, Value>,
	/// Param and affecting field values combined; the ordering/membership
	/// inputs of the view.
	pub affecting_data: Map<String, Value>,
}

#[derive(Clone)]
pub struct ViewAnalyzer {
	schema: Arc<SchemaRegistry>,
}

impl ViewAnalyzer {
	pub fn new(schema: Arc<SchemaRegistry>) -> Self {
		Self { schema }
	}

	/// Enumerate the views of `model` affected by a mutation of `resource`.
	///
	/// `fields` lists the field names whose values changed; `None` means
	/// "assume all fields changed". A view is affected iff `fields` is absent
	/// or intersects `{id} ∪ param_fields ∪ affecting_fields` — the id field
	/// always affects membership (create/delete).
	pub fn affected_views(
		&self,
		model: &str,
		resource: &Document,
		fields: Option<&[String]>,
	) -> Vec<AffectedView> {
		let Some(views) = self.schema.views_of(model) else {
			return Vec::new();
		};

		let mut affected = Vec::new();
		for (name, view) in views {
			if let Some(fields) = fields {
				let touches = fields.iter().any(|f| {
					f == "id" || view.param_fields.contains(f) || view.affecting_fields.contains(f)
				});
				if !touches {
					continue;
				}
			}

			let params = field_values(&view.param_fields, resource);
			let primary_params = field_values(&view.primary_keys, resource);
			let mut affecting_data = params.clone();
			affecting_data.extend(field_values(&view.affecting_fields, resource));

			affected.push(AffectedView {
				view: name.clone(),
				model: model.to_string(),
				params,
				primary_params,
				affecting_data,
			});
		}
		affected
	}
}

/// Read the named fields out of a resource; absent fields read as null.
fn field_values(fields: &[String], resource: &Document) -> Map<String, Value> {
	fields
		.iter()
		.map(|f| (f.clone(), resource.get(f).cloned().unwrap_or(Value::Null)))
		.collect()
}

/// Restrict caller-supplied view parameters to the declared param fields;
/// undefined parameters become null.
pub fn sanitize_params(view: &ViewSchema, params: Option<&Map<String, Value>>) -> Map<String, Value> {
	field_values(&view.param_fields, &params.cloned().unwrap_or_default())
}

/// The primary-key subset of a parameter map, used for channel naming.
pub fn primary_params(view: &ViewSchema, params: &Map<String, Value>) -> Map<String, Value> {
	field_values(&view.primary_keys, params)
}

/// Field names whose values differ between two documents, in either
/// direction (fields added, removed, or changed).
pub fn modified_fields(old: &Document, new: &Document) -> Vec<String> {
	old.keys()
		.chain(new.keys())
		.unique()
		.filter(|f| old.get(*f) != new.get(*f))
		.cloned()
		.collect()
}


// vim: ts=4
