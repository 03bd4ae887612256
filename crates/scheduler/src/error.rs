use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{txn::TxnOperation, value::Key};

/// Engine level errors: registry configuration and scheduler lifecycle.
#[derive(Debug, Error)]
pub enum Error {
	#[error("descriptor already registered <name='{0}'>")]
	DuplicateDescriptor(String),
	#[error("descriptor <name='{first}'> and <name='{second}'> declare overlapping key prefixes")]
	OverlappingPrefixes { first: String, second: String },
	#[error("key <key='{key}'> is claimed by both <descriptor='{first}'> and <descriptor='{second}'>")]
	OverlappingSelectors {
		key: Key,
		first: String,
		second: String,
	},
	#[error("unknown retrieve dependency: descriptor '{0}' depends on '{1}' which is not registered")]
	UnknownRetrieveDependency(String, String),
	#[error("circular retrieve dependency between descriptors: {0}")]
	CircularRetrieveDependency(String),
	#[error("descriptor not found <name='{0}'>")]
	DescriptorNotFound(String),
	#[error("scheduler is shut down")]
	Shutdown,
	#[error("scheduler stopped before delivering the outcome")]
	OutcomeDropped,
}

/// Returned by [`Descriptor::validate`](crate::Descriptor::validate) for a malformed value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ValidationError {
	pub message: String,
	/// Paths of the offending fields, if the descriptor can name them.
	pub invalid_fields: Vec<String>,
}

impl ValidationError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			invalid_fields: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_field(mut self, field: impl Into<String>) -> Self {
		self.invalid_fields.push(field.into());
		self
	}
}

/// Failure of a descriptor `Create`/`Update`/`Delete`/`Retrieve` call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{0}")]
pub struct OperationError(pub String);

impl OperationError {
	pub fn new(message: impl Into<String>) -> Self {
		Self(message.into())
	}
}

/// Why a single key did not converge. Always attributed to one key in the outcome report.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyError {
	#[error("invalid value: {0}")]
	Validation(ValidationError),
	#[error("{operation} failed: {error}")]
	Operation {
		operation: TxnOperation,
		error: OperationError,
	},
	#[error("retrieve failed for <descriptor='{descriptor}'>: {error}")]
	Retrieve {
		descriptor: String,
		error: OperationError,
	},
	#[error("dependency cycle: {}", .cycle.join(" -> "))]
	Cycle { cycle: Vec<Key> },
	#[error("no descriptor registered for the key")]
	Unimplemented,
	#[error("derived values cannot be changed directly <base='{base}'>")]
	DerivedKey { base: Key },
	#[error("blocked by failed removal of <key='{by}'>")]
	Blocked { by: Key },
	#[error("registry error: {message}")]
	Registry { message: String },
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_key_error_messages() {
		let err = KeyError::Operation {
			operation: TxnOperation::Create,
			error: OperationError::new("engine refused"),
		};
		assert_eq!(err.to_string(), "create failed: engine refused");

		let err = KeyError::Cycle {
			cycle: vec!["a".to_string(), "b".to_string()],
		};
		assert_eq!(err.to_string(), "dependency cycle: a -> b");

		let err = KeyError::Validation(ValidationError::new("missing name").with_field("name"));
		assert_eq!(err.to_string(), "invalid value: missing name");
	}
}
