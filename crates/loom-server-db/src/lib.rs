// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! # loom-server-db
//!
//! Persistence for the rotating crypto keys behind Loom's signed tokens,
//! using SQLite via sqlx.
//!
//! ## Repository Pattern
//!
//! - **`CryptoKeyStore` trait**: read-only lookups used by token signers and
//!   observers
//! - **`CryptoKeyRepository` struct**: concrete implementation holding a
//!   `SqlitePool`, plus the transactional executor
//!   [`CryptoKeyRepository::read_modify_update`] for mutations
//!
//! ## Error Handling
//!
//! | Variant | When to use |
//! |---------|-------------|
//! | `Conflict` | Unique constraint violation or concurrent modification; retryable |
//! | `Sqlx` | Let sqlx errors propagate via `?` for unexpected database errors |
//! | `Internal` | Data corruption, invalid stored data (e.g., unknown feature tag) |
//!
//! ## Testing
//!
//! Tests use in-memory SQLite with the production migration applied:
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_example() {
//!     let pool = testing::create_crypto_key_test_pool().await;
//!     let repo = CryptoKeyRepository::new(pool);
//!     // test operations...
//! }
//! ```
//!
//! ## Instrumentation
//!
//! Public methods carry `#[tracing::instrument]`, skipping `self` and key
//! material and recording the feature and sequence.

pub mod crypto_key;
mod error;
pub mod pool;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use crypto_key::{
	CryptoKey, CryptoKeyFeature, CryptoKeyRepository, CryptoKeyStore, CryptoKeyTx,
	InsertCryptoKeyParams, UpdateCryptoKeyDeletesAtParams,
};
pub use error::{DbError, Result, SerializationFailure};
pub use pool::{create_pool, run_migrations};
