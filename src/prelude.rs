pub use crate::error::{CcResult, Error, FilterPhase};

pub use tracing::{
	debug, info, warn, error,
};

// vim: ts=4
