// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

/// SQLite primary result codes that signal lock contention rather than a
/// broken statement. Extended codes (e.g. `SQLITE_BUSY_SNAPSHOT` = 517) share
/// the primary code in their low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Internal: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Classifies errors returned from a unit of work run by
/// [`CryptoKeyRepository::read_modify_update`](crate::CryptoKeyRepository::read_modify_update).
///
/// A serialization failure means another writer changed the rows this
/// transaction depended on; the whole unit is safe to run again.
pub trait SerializationFailure {
	fn is_serialization_failure(&self) -> bool;
}

impl SerializationFailure for DbError {
	fn is_serialization_failure(&self) -> bool {
		match self {
			DbError::Conflict(_) => true,
			DbError::Sqlx(sqlx::Error::Database(e)) => {
				if e.is_unique_violation() {
					return true;
				}
				e.code()
					.and_then(|code| code.parse::<i32>().ok())
					.map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
					.unwrap_or(false)
			}
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conflict_is_serialization_failure() {
		assert!(DbError::Conflict("crypto key taken".into()).is_serialization_failure());
	}

	#[test]
	fn other_errors_are_not_serialization_failures() {
		assert!(!DbError::Internal("x".into()).is_serialization_failure());
		assert!(!DbError::Sqlx(sqlx::Error::RowNotFound).is_serialization_failure());
		assert!(!DbError::Sqlx(sqlx::Error::PoolTimedOut).is_serialization_failure());
	}

	#[test]
	fn only_conflict_variant_is_retryable_by_kind() {
		let errors = [
			DbError::Sqlx(sqlx::Error::RowNotFound),
			DbError::Conflict("x".into()),
			DbError::Internal("x".into()),
		];
		for err in errors {
			let expected = match &err {
				DbError::Conflict(_) => true,
				DbError::Sqlx(_) | DbError::Internal(_) => false,
			};
			assert_eq!(err.is_serialization_failure(), expected, "{err}");
		}
	}

	#[tokio::test]
	async fn unique_violation_is_serialization_failure() {
		let pool = crate::testing::create_test_pool().await;
		sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
			.execute(&pool)
			.await
			.unwrap();
		sqlx::query("INSERT INTO t (id) VALUES (1)")
			.execute(&pool)
			.await
			.unwrap();

		let err = sqlx::query("INSERT INTO t (id) VALUES (1)")
			.execute(&pool)
			.await
			.unwrap_err();

		assert!(DbError::from(err).is_serialization_failure());
	}

	#[tokio::test]
	async fn trigger_abort_is_not_serialization_failure() {
		let pool = crate::testing::create_test_pool().await;
		sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
			.execute(&pool)
			.await
			.unwrap();
		sqlx::query(
			"CREATE TRIGGER t_reject BEFORE INSERT ON t BEGIN SELECT RAISE(ABORT, 'rejected'); END",
		)
		.execute(&pool)
		.await
		.unwrap();

		let err = sqlx::query("INSERT INTO t (id) VALUES (1)")
			.execute(&pool)
			.await
			.unwrap_err();

		assert!(!DbError::from(err).is_serialization_failure());
	}
}
