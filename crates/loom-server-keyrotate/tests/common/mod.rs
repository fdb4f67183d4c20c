// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use loom_server_db::{create_pool, run_migrations, CryptoKeyFeature, CryptoKeyRepository};
use loom_server_keyrotate::{KeyRotator, KeyRotatorConfig, MockClock};
use sqlx::SqlitePool;
use tempfile::TempDir;

pub const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter("loom_server_keyrotate=debug,loom_server_db=debug")
		.with_test_writer()
		.try_init();
}

pub fn t0() -> DateTime<Utc> {
	Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
}

pub async fn memory_pool() -> SqlitePool {
	loom_server_db::testing::create_crypto_key_test_pool().await
}

/// A file-backed database in a fresh temporary directory. Keep the `TempDir`
/// alive for as long as the pool is used.
pub async fn file_db(migrate: bool) -> (String, TempDir) {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("keyrotate.db");
	let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
	if migrate {
		let pool = create_pool(&db_url).await.unwrap();
		run_migrations(&pool).await.unwrap();
		pool.close().await;
	}
	(db_url, dir)
}

pub fn config(features: &[CryptoKeyFeature]) -> KeyRotatorConfig {
	KeyRotatorConfig {
		key_duration: SEVEN_DAYS,
		features: features.to_vec(),
		..Default::default()
	}
}

pub fn rotator(pool: SqlitePool, config: &KeyRotatorConfig, clock: &MockClock) -> KeyRotator {
	KeyRotator::new(CryptoKeyRepository::new(pool), config)
		.unwrap()
		.with_clock(Arc::new(clock.clone()))
}
