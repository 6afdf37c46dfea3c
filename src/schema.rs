//! Model and view declarations, indexed for O(1) lookup.
//!
//! The registry is read-only metadata: built once from the host's model map
//! and never mutated. Access control and filter hooks are opaque to the core;
//! they are called with a request context and must either admit or reject.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::prelude::*;
use crate::store::ViewQuery;
use crate::types::{Document, Query};

/// Context handed to access control and filter hooks.
#[derive(Debug)]
pub struct HookRequest<'a> {
	pub query: &'a Query,
	pub auth_token: Option<&'a Value>,
	/// Loaded resource; present in the post phase for resource subscribes.
	pub resource: Option<&'a Document>,
	pub phase: FilterPhase,
}

/// Admission hook attached to a model. Any `Err` is a denial; the pipeline
/// normalizes it into `Error::Blocked` tagged with the phase.
#[async_trait]
pub trait FilterHook: Send + Sync {
	async fn check(&self, req: &HookRequest<'_>) -> CcResult<()>;
}

/// Wraps a synchronous closure as a `FilterHook`.
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> FilterHook for FnHook<F>
where
	F: Fn(&HookRequest<'_>) -> CcResult<()> + Send + Sync,
{
	async fn check(&self, req: &HookRequest<'_>) -> CcResult<()> {
		(self.0)(req)
	}
}

/// Transform composing a view's collection query from a base query and the
/// sanitized view parameters.
pub type ViewTransform = Arc<dyn Fn(ViewQuery, &Map<String, Value>) -> ViewQuery + Send + Sync>;

/// Declaration of one ordered, optionally-filtered projection of a model.
#[derive(Clone)]
pub struct ViewSchema {
	/// Document fields whose values parameterize the view.
	pub param_fields: Vec<String>,
	/// Additional fields that can change membership or ordering without
	/// appearing in the parameters.
	pub affecting_fields: Vec<String>,
	/// Subset of the parameters that names a subscribable view instance.
	pub primary_keys: Vec<String>,
	pub transform: Option<ViewTransform>,
}

impl ViewSchema {
	/// Declare a view. `primary_keys` defaults to `param_fields`.
	pub fn new(param_fields: &[&str]) -> Self {
		let param_fields: Vec<String> = param_fields.iter().map(|f| f.to_string()).collect();
		Self {
			primary_keys: param_fields.clone(),
			param_fields,
			affecting_fields: Vec::new(),
			transform: None,
		}
	}

	pub fn with_affecting(mut self, fields: &[&str]) -> Self {
		self.affecting_fields = fields.iter().map(|f| f.to_string()).collect();
		self
	}

	pub fn with_primary_keys(mut self, fields: &[&str]) -> Self {
		self.primary_keys = fields.iter().map(|f| f.to_string()).collect();
		self
	}

	pub fn with_transform(
		mut self,
		transform: impl Fn(ViewQuery, &Map<String, Value>) -> ViewQuery + Send + Sync + 'static,
	) -> Self {
		self.transform = Some(Arc::new(transform));
		self
	}
}

/// Declaration of one model type.
#[derive(Clone, Default)]
pub struct ModelSchema {
	pub fields: Vec<String>,
	pub views: HashMap<String, ViewSchema>,
	pub access_control: Option<Arc<dyn FilterHook>>,
	pub pre_filter: Option<Arc<dyn FilterHook>>,
	pub post_filter: Option<Arc<dyn FilterHook>>,
}

impl ModelSchema {
	pub fn new(fields: &[&str]) -> Self {
		Self { fields: fields.iter().map(|f| f.to_string()).collect(), ..Default::default() }
	}

	pub fn with_view(mut self, name: impl Into<String>, view: ViewSchema) -> Self {
		self.views.insert(name.into(), view);
		self
	}

	pub fn with_access_control(mut self, hook: Arc<dyn FilterHook>) -> Self {
		self.access_control = Some(hook);
		self
	}

	pub fn with_pre_filter(mut self, hook: Arc<dyn FilterHook>) -> Self {
		self.pre_filter = Some(hook);
		self
	}

	pub fn with_post_filter(mut self, hook: Arc<dyn FilterHook>) -> Self {
		self.post_filter = Some(hook);
		self
	}
}

/// Read-only index of model types, fields, and view declarations.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
	models: HashMap<String, ModelSchema>,
}

impl SchemaRegistry {
	pub fn new(models: HashMap<String, ModelSchema>) -> Self {
		Self { models }
	}

	pub fn has_type(&self, model: &str) -> bool {
		self.models.contains_key(model)
	}

	pub fn model(&self, model: &str) -> Option<&ModelSchema> {
		self.models.get(model)
	}

	pub fn fields_of(&self, model: &str) -> Option<&[String]> {
		self.models.get(model).map(|m| m.fields.as_slice())
	}

	pub fn views_of(&self, model: &str) -> Option<&HashMap<String, ViewSchema>> {
		self.models.get(model).map(|m| &m.views)
	}

	pub fn view_schema(&self, model: &str, view: &str) -> Option<&ViewSchema> {
		self.models.get(model).and_then(|m| m.views.get(view))
	}

	pub fn filter_hook(&self, model: &str, phase: FilterPhase) -> Option<&Arc<dyn FilterHook>> {
		let schema = self.models.get(model)?;
		match phase {
			FilterPhase::Pre => schema.pre_filter.as_ref(),
			FilterPhase::Post => schema.post_filter.as_ref(),
		}
	}

	pub fn access_control_hook(&self, model: &str) -> Option<&Arc<dyn FilterHook>> {
		self.models.get(model)?.access_control.as_ref()
	}
}


// vim: ts=4
