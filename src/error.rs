use crate::prelude::*;

pub type CcResult<T> = std::result::Result<T, Error>;

/// Phase of the filter pipeline that produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
	Pre,
	Post,
}

impl std::fmt::Display for FilterPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			FilterPhase::Pre => write!(f, "pre"),
			FilterPhase::Post => write!(f, "post"),
		}
	}
}

/// Errors surfaced to callers and middleware.
///
/// `Clone` so a single fetch failure can be fanned out to every waiter
/// coalesced on the same cache flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
	/// Malformed query or update details
	InvalidArguments(String),
	/// Model type not present in the schema
	InvalidModelType(Box<str>),
	/// Missing id, bad view parameters, or a primitive where an object is required
	InvalidParams(String),
	/// Attempt to modify the id field or replace a document with a primitive
	InvalidOperation(String),
	/// A filter hook denied the request
	Blocked(FilterPhase),
	/// An outside client attempted to publish to a crud channel
	PublishNotAllowed(Box<str>),
	/// Resource channel subscription failed while reads were buffered on it
	SubscribeFailed(Box<str>),
	/// Store I/O failure; the raw error is logged, callers see this sanitized form
	Store(String),
	NotFound,
}

impl Error {
	/// Wrap a raw store error: log it, hand the caller a sanitized message.
	pub fn store(err: impl std::fmt::Display) -> Self {
		warn!("store error: {}", err);
		Self::Store("store operation failed".to_string())
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
			Error::InvalidModelType(model) => write!(f, "unknown model type: {}", model),
			Error::InvalidParams(msg) => write!(f, "invalid parameters: {}", msg),
			Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
			Error::Blocked(phase) => write!(f, "blocked by {} filter", phase),
			Error::PublishNotAllowed(channel) => {
				write!(f, "publishing to {} is not allowed", channel)
			}
			Error::SubscribeFailed(channel) => {
				write!(f, "failed to subscribe to resource channel {}", channel)
			}
			Error::Store(msg) => write!(f, "{}", msg),
			Error::NotFound => write!(f, "resource not found"),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!("json error: {}", err);
		Error::InvalidArguments(err.to_string())
	}
}

// vim: ts=4
