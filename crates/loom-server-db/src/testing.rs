// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory pools for tests. Enabled for dependent crates by the
//! `test-utils` feature.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

pub async fn create_test_pool() -> SqlitePool {
	let options = SqliteConnectOptions::from_str(":memory:")
		.unwrap()
		.create_if_missing(true);

	SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await
		.expect("Failed to create test pool")
}

pub async fn create_crypto_keys_table(pool: &SqlitePool) {
	crate::pool::run_migrations(pool).await.unwrap();
}

pub async fn create_crypto_key_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	create_crypto_keys_table(&pool).await;
	pool
}
