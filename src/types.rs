//! Common types used throughout the crudcast data layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document: a map from field name to JSON value.
pub type Document = Map<String, Value>;

// Query //
//*******//

/// The inbound request envelope shared by all CRUD operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
	/// Model type; required and must exist in the schema.
	#[serde(rename = "type")]
	pub r#type: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,

	/// Single field addressed by the operation; requires `id`.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub field: Option<String>,

	/// Payload for create (object) and update (object or scalar with `field`).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,

	/// Named view for collection reads; must be declared on the model.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub view: Option<String>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub view_params: Option<Map<String, Value>>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub page_size: Option<usize>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub offset: Option<u64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub get_count: Option<bool>,
}

impl Query {
	/// A minimal query addressing one resource.
	pub fn resource(model: impl Into<String>, id: impl Into<String>) -> Self {
		Self { r#type: model.into(), id: Some(id.into()), ..Default::default() }
	}
}

// Change messages //
//*****************//

/// Position change of a document within a view instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewAction {
	/// Same view instance, ordering or affecting data changed
	Move,
	/// Left this view instance
	Remove,
	/// Entered this view instance
	Add,
}

/// Message published on crud channels when documents change.
///
/// Resource-level channels carry no message at all (an empty publish means
/// "refetch"); field and view channels carry one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeMessage {
	Create {
		id: String,
	},
	Update {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		action: Option<ViewAction>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		id: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		value: Option<Value>,
	},
	Delete {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		id: Option<String>,
	},
}

impl ChangeMessage {
	/// Field channel update: `{type:"update", value}`.
	pub fn field_update(value: Value) -> Self {
		Self::Update { action: None, id: None, value: Some(value) }
	}

	/// Field channel deletion: `{type:"delete"}`.
	pub fn field_delete() -> Self {
		Self::Delete { id: None }
	}

	/// View channel creation: `{type:"create", id}`.
	pub fn view_create(id: impl Into<String>) -> Self {
		Self::Create { id: id.into() }
	}

	/// View channel membership/ordering change: `{type:"update", action, id}`.
	pub fn view_update(action: ViewAction, id: impl Into<String>) -> Self {
		Self::Update { action: Some(action), id: Some(id.into()), value: None }
	}

	/// Coarse view channel update without an action (out-of-band notifiers).
	pub fn view_touch(id: impl Into<String>) -> Self {
		Self::Update { action: None, id: Some(id.into()), value: None }
	}

	/// View channel deletion: `{type:"delete", id}`.
	pub fn view_delete(id: impl Into<String>) -> Self {
		Self::Delete { id: Some(id.into()) }
	}

	pub fn to_value(&self) -> Value {
		serde_json::to_value(self).unwrap_or(Value::Null)
	}
}

// Read results //
//**************//

/// One page of a materialized view: ids in view order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPage {
	pub data: Vec<String>,
	pub is_last_page: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub count: Option<u64>,
}

/// Result of a read operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
	/// Read by id
	Document(Document),
	/// Read by id with `field` set
	Field(Value),
	/// Collection read
	Page(ViewPage),
}


// vim: ts=4
