// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for key rotation.

use loom_server_db::{DbError, SerializationFailure};
use thiserror::Error;

/// Result type alias for key rotation operations.
pub type KeyRotateResult<T> = Result<T, KeyRotateError>;

/// Errors that can occur while rotating keys.
#[derive(Debug, Error)]
pub enum KeyRotateError {
	// =========================================================================
	// Configuration Errors
	// =========================================================================
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("unknown crypto key feature: {0}")]
	UnknownFeature(String),

	// =========================================================================
	// Key Material Errors
	// =========================================================================
	#[error("generate secret for {feature}: {message}")]
	SecretGeneration { feature: String, message: String },

	// =========================================================================
	// Infrastructure Errors
	// =========================================================================
	#[error("{context}: {source}")]
	Store {
		context: String,
		#[source]
		source: DbError,
	},

	#[error("database error: {0}")]
	Database(#[from] DbError),
}

impl KeyRotateError {
	/// Wrap a store failure with the operation and key it concerned.
	pub fn store(context: impl Into<String>) -> impl FnOnce(DbError) -> Self {
		let context = context.into();
		move |source| KeyRotateError::Store { context, source }
	}

	/// Returns true if the failure is expected to clear up on a later scan
	/// (lock contention, a concurrent replica winning the race).
	pub fn is_transient(&self) -> bool {
		self.is_serialization_failure()
	}
}

impl SerializationFailure for KeyRotateError {
	fn is_serialization_failure(&self) -> bool {
		match self {
			KeyRotateError::Store { source, .. } | KeyRotateError::Database(source) => {
				source.is_serialization_failure()
			}
			_ => false,
		}
	}
}
