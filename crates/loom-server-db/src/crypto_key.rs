// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crypto key repository for database operations.
//!
//! Each feature that signs or encrypts short-lived tokens owns a chain of
//! symmetric secrets, one row per `(feature, sequence)`. The row with
//! `deletes_at IS NULL` is the current key for new tokens; retired rows stay
//! around until `deletes_at` so tokens issued under them still verify.
//!
//! Mutations happen inside [`CryptoKeyRepository::read_modify_update`], which
//! runs a whole unit of work in one transaction and replays it when a
//! concurrent writer got there first.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, SerializationFailure};

/// Attempts made by [`CryptoKeyRepository::read_modify_update`] before a
/// serialization failure is handed back to the caller.
const MAX_TX_ATTEMPTS: u32 = 5;

/// Upper bound of the random pause between attempts, scaled by attempt number.
const MAX_RETRY_JITTER_MS: u64 = 25;

/// A consumer of a rotating secret.
///
/// The set is closed: adding a feature means adding a variant here and a
/// policy entry wherever secrets are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoKeyFeature {
	/// Signing/encryption of workspace application access tokens.
	WorkspaceApps,
	/// OIDC account-linking (convert login type) tokens.
	OidcConvert,
	/// Peer reconnection tokens.
	PeerReconnect,
}

impl CryptoKeyFeature {
	/// Every known feature, in storage order.
	pub const ALL: [CryptoKeyFeature; 3] = [
		CryptoKeyFeature::WorkspaceApps,
		CryptoKeyFeature::OidcConvert,
		CryptoKeyFeature::PeerReconnect,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			CryptoKeyFeature::WorkspaceApps => "workspace_apps",
			CryptoKeyFeature::OidcConvert => "oidc_convert",
			CryptoKeyFeature::PeerReconnect => "peer_reconnect",
		}
	}
}

impl fmt::Display for CryptoKeyFeature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CryptoKeyFeature {
	type Err = DbError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		CryptoKeyFeature::ALL
			.into_iter()
			.find(|feature| feature.as_str() == s)
			.ok_or_else(|| DbError::Internal(format!("unknown crypto key feature: {s}")))
	}
}

/// One generation of a feature's secret.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct CryptoKey {
	pub feature: CryptoKeyFeature,
	pub sequence: i32,
	/// Hex-encoded key material. Never serialized.
	#[serde(skip_serializing)]
	pub secret: String,
	pub starts_at: DateTime<Utc>,
	pub deletes_at: Option<DateTime<Utc>>,
}

impl CryptoKey {
	/// The instant after which this key must no longer sign new tokens.
	pub fn expires_at(&self, key_duration: chrono::Duration) -> DateTime<Utc> {
		self.starts_at + key_duration
	}

	/// Whether this is the feature's key for new tokens.
	pub fn is_current(&self) -> bool {
		self.deletes_at.is_none()
	}
}

impl fmt::Debug for CryptoKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CryptoKey")
			.field("feature", &self.feature)
			.field("sequence", &self.sequence)
			.field("secret", &"[REDACTED]")
			.field("starts_at", &self.starts_at)
			.field("deletes_at", &self.deletes_at)
			.finish()
	}
}

#[derive(Clone)]
pub struct InsertCryptoKeyParams {
	pub feature: CryptoKeyFeature,
	pub sequence: i32,
	pub secret: String,
	pub starts_at: DateTime<Utc>,
}

impl fmt::Debug for InsertCryptoKeyParams {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InsertCryptoKeyParams")
			.field("feature", &self.feature)
			.field("sequence", &self.sequence)
			.field("secret", &"[REDACTED]")
			.field("starts_at", &self.starts_at)
			.finish()
	}
}

#[derive(Debug, Clone)]
pub struct UpdateCryptoKeyDeletesAtParams {
	pub feature: CryptoKeyFeature,
	pub sequence: i32,
	pub deletes_at: DateTime<Utc>,
}

#[async_trait]
pub trait CryptoKeyStore: Send + Sync {
	async fn get_crypto_keys(&self) -> Result<Vec<CryptoKey>, DbError>;
	async fn get_crypto_keys_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Vec<CryptoKey>, DbError>;
	async fn get_crypto_key_by_feature_and_sequence(
		&self,
		feature: CryptoKeyFeature,
		sequence: i32,
	) -> Result<Option<CryptoKey>, DbError>;
	async fn get_latest_crypto_key_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Option<CryptoKey>, DbError>;
}

#[async_trait]
impl CryptoKeyStore for CryptoKeyRepository {
	async fn get_crypto_keys(&self) -> Result<Vec<CryptoKey>, DbError> {
		self.get_crypto_keys().await
	}

	async fn get_crypto_keys_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Vec<CryptoKey>, DbError> {
		self.get_crypto_keys_by_feature(feature).await
	}

	async fn get_crypto_key_by_feature_and_sequence(
		&self,
		feature: CryptoKeyFeature,
		sequence: i32,
	) -> Result<Option<CryptoKey>, DbError> {
		self
			.get_crypto_key_by_feature_and_sequence(feature, sequence)
			.await
	}

	async fn get_latest_crypto_key_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Option<CryptoKey>, DbError> {
		self.get_latest_crypto_key_by_feature(feature).await
	}
}

/// Repository for crypto key database operations.
#[derive(Clone, Debug)]
pub struct CryptoKeyRepository {
	pool: SqlitePool,
}

impl CryptoKeyRepository {
	/// Create a new crypto key repository with the given pool.
	///
	/// # Arguments
	/// * `pool` - SQLite connection pool
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// List every stored key, ordered by feature then sequence.
	#[tracing::instrument(skip(self))]
	pub async fn get_crypto_keys(&self) -> Result<Vec<CryptoKey>, DbError> {
		select_crypto_keys(&self.pool, None).await
	}

	/// List one feature's keys, ordered by sequence.
	#[tracing::instrument(skip(self), fields(feature = %feature))]
	pub async fn get_crypto_keys_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Vec<CryptoKey>, DbError> {
		select_crypto_keys(&self.pool, Some(feature)).await
	}

	/// Get a single generation of a feature's key.
	///
	/// # Returns
	/// `None` if the key was never created or has already been deleted.
	#[tracing::instrument(skip(self), fields(feature = %feature))]
	pub async fn get_crypto_key_by_feature_and_sequence(
		&self,
		feature: CryptoKeyFeature,
		sequence: i32,
	) -> Result<Option<CryptoKey>, DbError> {
		let row = sqlx::query(
			r#"
			SELECT feature, sequence, secret, starts_at, deletes_at
			FROM crypto_keys
			WHERE feature = ? AND sequence = ?
			"#,
		)
		.bind(feature.as_str())
		.bind(sequence)
		.fetch_optional(&self.pool)
		.await?;

		row.as_ref().map(parse_crypto_key_row).transpose()
	}

	/// Get the highest-sequence key of a feature, retired or not.
	#[tracing::instrument(skip(self), fields(feature = %feature))]
	pub async fn get_latest_crypto_key_by_feature(
		&self,
		feature: CryptoKeyFeature,
	) -> Result<Option<CryptoKey>, DbError> {
		let row = sqlx::query(
			r#"
			SELECT feature, sequence, secret, starts_at, deletes_at
			FROM crypto_keys
			WHERE feature = ?
			ORDER BY sequence DESC
			LIMIT 1
			"#,
		)
		.bind(feature.as_str())
		.fetch_optional(&self.pool)
		.await?;

		row.as_ref().map(parse_crypto_key_row).transpose()
	}

	/// Run `f` inside a single transaction.
	///
	/// The transaction commits when `f` returns `Ok` and rolls back otherwise,
	/// so either every write `f` issued lands or none do. When the failure
	/// reports [`SerializationFailure::is_serialization_failure`] the whole
	/// unit is replayed against fresh state, up to five attempts in total.
	///
	/// `f` may be called more than once and must not keep side effects
	/// outside the transaction.
	#[tracing::instrument(skip_all)]
	pub async fn read_modify_update<T, E, F>(&self, mut f: F) -> Result<T, E>
	where
		F: for<'t> FnMut(CryptoKeyTx<'t>) -> BoxFuture<'t, Result<T, E>> + Send,
		T: Send,
		E: From<DbError> + SerializationFailure + Send,
	{
		let mut attempt = 0u32;
		loop {
			attempt += 1;
			match self.run_in_tx(&mut f).await {
				Err(e) if e.is_serialization_failure() && attempt < MAX_TX_ATTEMPTS => {
					let delay = Duration::from_millis(
						fastrand::u64(1..=MAX_RETRY_JITTER_MS) * u64::from(attempt),
					);
					tracing::debug!(
						attempt,
						delay_ms = delay.as_millis() as u64,
						"crypto key transaction conflicted, retrying"
					);
					tokio::time::sleep(delay).await;
				}
				result => return result,
			}
		}
	}

	async fn run_in_tx<T, E, F>(&self, f: &mut F) -> Result<T, E>
	where
		F: for<'t> FnMut(CryptoKeyTx<'t>) -> BoxFuture<'t, Result<T, E>> + Send,
		T: Send,
		E: From<DbError> + SerializationFailure + Send,
	{
		let mut tx = self.pool.begin().await.map_err(DbError::from)?;

		match f(CryptoKeyTx { conn: &mut *tx }).await {
			Ok(value) => {
				tx.commit().await.map_err(DbError::from)?;
				Ok(value)
			}
			Err(e) => {
				if let Err(rollback) = tx.rollback().await {
					tracing::warn!(error = %rollback, "failed to roll back crypto key transaction");
				}
				Err(e)
			}
		}
	}
}

/// Store handle passed to a [`CryptoKeyRepository::read_modify_update`] unit
/// of work. Every call runs on the enclosing transaction.
pub struct CryptoKeyTx<'c> {
	conn: &'c mut SqliteConnection,
}

impl CryptoKeyTx<'_> {
	/// List every key, ordered by feature then sequence.
	#[tracing::instrument(skip(self))]
	pub async fn list_crypto_keys(&mut self) -> Result<Vec<CryptoKey>, DbError> {
		select_crypto_keys(&mut *self.conn, None).await
	}

	/// Insert a new current key.
	///
	/// # Errors
	/// `DbError::Conflict` if `(feature, sequence)` already exists, which means
	/// a concurrent rotation committed first.
	#[tracing::instrument(skip(self, params), fields(feature = %params.feature, sequence = params.sequence))]
	pub async fn insert_crypto_key(
		&mut self,
		params: &InsertCryptoKeyParams,
	) -> Result<CryptoKey, DbError> {
		let row = sqlx::query(
			r#"
			INSERT INTO crypto_keys (feature, sequence, secret, starts_at)
			VALUES (?, ?, ?, ?)
			RETURNING feature, sequence, secret, starts_at, deletes_at
			"#,
		)
		.bind(params.feature.as_str())
		.bind(params.sequence)
		.bind(&params.secret)
		.bind(format_time(&params.starts_at))
		.fetch_one(&mut *self.conn)
		.await
		.map_err(|e| match e {
			sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Conflict(format!(
				"crypto key {}/{} already exists",
				params.feature, params.sequence
			)),
			e => DbError::Sqlx(e),
		})?;

		let key = parse_crypto_key_row(&row)?;
		tracing::debug!(feature = %key.feature, sequence = key.sequence, "crypto key inserted");
		Ok(key)
	}

	/// Stamp the retirement time on a current key.
	///
	/// A retirement time is written once and never cleared or moved.
	///
	/// # Errors
	/// `DbError::Conflict` if the key is gone or already retired.
	#[tracing::instrument(skip(self, params), fields(feature = %params.feature, sequence = params.sequence))]
	pub async fn update_crypto_key_deletes_at(
		&mut self,
		params: &UpdateCryptoKeyDeletesAtParams,
	) -> Result<CryptoKey, DbError> {
		let row = sqlx::query(
			r#"
			UPDATE crypto_keys
			SET deletes_at = ?
			WHERE feature = ? AND sequence = ? AND deletes_at IS NULL
			RETURNING feature, sequence, secret, starts_at, deletes_at
			"#,
		)
		.bind(format_time(&params.deletes_at))
		.bind(params.feature.as_str())
		.bind(params.sequence)
		.fetch_optional(&mut *self.conn)
		.await?;

		match row {
			Some(row) => {
				let key = parse_crypto_key_row(&row)?;
				tracing::debug!(
					feature = %key.feature,
					sequence = key.sequence,
					deletes_at = %params.deletes_at.to_rfc3339(),
					"crypto key deletes_at set"
				);
				Ok(key)
			}
			None => Err(DbError::Conflict(format!(
				"crypto key {}/{} is missing or already retired",
				params.feature, params.sequence
			))),
		}
	}

	/// Remove a key outright.
	///
	/// # Returns
	/// `true` if a row was deleted.
	#[tracing::instrument(skip(self), fields(feature = %feature))]
	pub async fn delete_crypto_key(
		&mut self,
		feature: CryptoKeyFeature,
		sequence: i32,
	) -> Result<bool, DbError> {
		let result = sqlx::query("DELETE FROM crypto_keys WHERE feature = ? AND sequence = ?")
			.bind(feature.as_str())
			.bind(sequence)
			.execute(&mut *self.conn)
			.await?;

		let deleted = result.rows_affected() > 0;
		if deleted {
			tracing::debug!(feature = %feature, sequence, "crypto key deleted");
		}
		Ok(deleted)
	}
}

async fn select_crypto_keys<'e, X>(
	executor: X,
	feature: Option<CryptoKeyFeature>,
) -> Result<Vec<CryptoKey>, DbError>
where
	X: sqlx::Executor<'e, Database = Sqlite>,
{
	let rows = sqlx::query(
		r#"
		SELECT feature, sequence, secret, starts_at, deletes_at
		FROM crypto_keys
		WHERE ?1 IS NULL OR feature = ?1
		ORDER BY feature ASC, sequence ASC
		"#,
	)
	.bind(feature.map(|f| f.as_str()))
	.fetch_all(executor)
	.await?;

	let mut keys = Vec::with_capacity(rows.len());
	for row in &rows {
		keys.push(parse_crypto_key_row(row)?);
	}
	Ok(keys)
}

fn format_time(time: &DateTime<Utc>) -> String {
	time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>, DbError> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| DbError::Internal(format!("Invalid {column}: {e}")))
}

fn parse_crypto_key_row(row: &SqliteRow) -> Result<CryptoKey, DbError> {
	let feature_str: String = row.try_get("feature")?;
	let sequence: i32 = row.try_get("sequence")?;
	let secret: String = row.try_get("secret")?;
	let starts_at_str: String = row.try_get("starts_at")?;
	let deletes_at_str: Option<String> = row.try_get("deletes_at")?;

	Ok(CryptoKey {
		feature: feature_str.parse()?,
		sequence,
		secret,
		starts_at: parse_time("starts_at", &starts_at_str)?,
		deletes_at: deletes_at_str
			.map(|s| parse_time("deletes_at", &s))
			.transpose()?,
	})
}
