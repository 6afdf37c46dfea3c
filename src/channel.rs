//! Deterministic channel naming for resources, fields, and views.
//!
//! Producers and consumers meet on these names without coordination, so the
//! encoding must be stable and reversible:
//!
//! ```text
//! crud>Product/p1                               resource
//! crud>Product/p1/categoryId                    field
//! crud>byCat({"categoryId":"c1"}):Product       view instance
//! ```

use itertools::Itertools;
use serde_json::{Map, Value};

/// Prefix shared by every channel this crate owns.
pub const CHANNEL_PREFIX: &str = "crud>";

/// Parsed form of a crud channel name.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelAddr {
	Model { model: String, id: Option<String>, field: Option<String> },
	View { model: String, view: String, params: Map<String, Value> },
}

impl ChannelAddr {
	/// Re-encode this address to its channel name.
	pub fn name(&self) -> String {
		match self {
			ChannelAddr::Model { model, id: None, .. } => format!("{}{}", CHANNEL_PREFIX, model),
			ChannelAddr::Model { model, id: Some(id), field: None } => resource_channel(model, id),
			ChannelAddr::Model { model, id: Some(id), field: Some(field) } => {
				field_channel(model, id, field)
			}
			ChannelAddr::View { model, view, params } => view_channel(model, view, params),
		}
	}
}

pub fn resource_channel(model: &str, id: &str) -> String {
	format!("{}{}/{}", CHANNEL_PREFIX, model, id)
}

pub fn field_channel(model: &str, id: &str, field: &str) -> String {
	format!("{}{}/{}/{}", CHANNEL_PREFIX, model, id, field)
}

/// Channel for one view instance. The parameter object is serialized
/// canonically so any caller holding the same parameter values lands on the
/// same name.
pub fn view_channel(model: &str, view: &str, params: &Map<String, Value>) -> String {
	let mut encoded = String::new();
	write_canonical_map(params, &mut encoded);
	format!("{}{}({}):{}", CHANNEL_PREFIX, view, encoded, model)
}

/// Serialize a JSON value with object keys sorted lexicographically at every
/// depth.
pub fn canonical_json(value: &Value) -> String {
	let mut out = String::new();
	write_canonical(value, &mut out);
	out
}

fn write_canonical(value: &Value, out: &mut String) {
	match value {
		Value::Object(map) => write_canonical_map(map, out),
		Value::Array(items) => {
			out.push('[');
			for (i, item) in items.iter().enumerate() {
				if i > 0 {
					out.push(',');
				}
				write_canonical(item, out);
			}
			out.push(']');
		}
		other => out.push_str(&other.to_string()),
	}
}

fn write_canonical_map(map: &Map<String, Value>, out: &mut String) {
	out.push('{');
	for (i, key) in map.keys().sorted().enumerate() {
		if i > 0 {
			out.push(',');
		}
		out.push_str(&Value::String(key.clone()).to_string());
		out.push(':');
		write_canonical(&map[key], out);
	}
	out.push('}');
}

/// Parse a channel name back into its address. Returns `None` for channels
/// this crate does not own or malformed names.
///
/// A `:` anywhere after the prefix selects the view form; otherwise the name
/// is the slash-separated model form.
pub fn parse(channel: &str) -> Option<ChannelAddr> {
	let rest = channel.strip_prefix(CHANNEL_PREFIX)?;
	if rest.is_empty() {
		return None;
	}

	if rest.contains(':') {
		let open = rest.find('(')?;
		let close = rest.rfind("):")?;
		if close < open {
			return None;
		}
		let view = &rest[..open];
		let params_json = &rest[open + 1..close];
		let model = &rest[close + 2..];
		if view.is_empty() || model.is_empty() {
			return None;
		}
		let params = serde_json::from_str::<Map<String, Value>>(params_json).ok()?;
		Some(ChannelAddr::View { model: model.to_string(), view: view.to_string(), params })
	} else {
		let mut segments = rest.splitn(3, '/');
		let model = segments.next().filter(|s| !s.is_empty())?;
		let id = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
		let field = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
		Some(ChannelAddr::Model { model: model.to_string(), id, field })
	}
}


// vim: ts=4
