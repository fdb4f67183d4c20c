// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The rotation coordinator.
//!
//! One scan reads every managed key, classifies each one, and applies the
//! resulting inserts, retirements and deletions in a single transaction.
//! Features without a current key are bootstrapped in the same transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::rngs::OsRng;
use rand::RngCore;
use loom_server_db::{
	CryptoKey, CryptoKeyFeature, CryptoKeyRepository, CryptoKeyTx, InsertCryptoKeyParams,
	UpdateCryptoKeyDeletesAtParams,
};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::clock::{db_time, Clock, SystemClock};
use crate::config::KeyRotatorConfig;
use crate::decision::{classify, KeyAction};
use crate::error::{KeyRotateError, KeyRotateResult};
use crate::policy::RotationPolicy;
use crate::secret::generate_secret_from;

/// Keeps each managed feature's signing key fresh.
#[derive(Debug, Clone)]
pub struct KeyRotator {
	pub(crate) repo: CryptoKeyRepository,
	pub(crate) plan: Arc<ScanPlan>,
	pub(crate) clock: Arc<dyn Clock>,
	pub(crate) scan_interval: Duration,
	pub(crate) results_tx: Option<mpsc::Sender<Vec<CryptoKey>>>,
}

/// Everything a scan needs besides the transaction. Shared so each replay of
/// the unit of work can own a handle to it.
#[derive(Debug)]
pub(crate) struct ScanPlan {
	policy: RotationPolicy,
	features: BTreeSet<CryptoKeyFeature>,
}

#[derive(Debug, Default)]
struct ScanSummary {
	rotated: usize,
	deleted: usize,
	bootstrapped: usize,
}

impl KeyRotator {
	/// Build a rotator over `repo`, validating `config` first.
	pub fn new(repo: CryptoKeyRepository, config: &KeyRotatorConfig) -> KeyRotateResult<Self> {
		config.validate()?;

		let plan = ScanPlan {
			policy: config.rotation_policy()?,
			features: config.managed_features().into_iter().collect(),
		};

		Ok(Self {
			repo,
			plan: Arc::new(plan),
			clock: Arc::new(SystemClock),
			scan_interval: config.scan_interval,
			results_tx: None,
		})
	}

	/// Read time from `clock` instead of the system clock.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Publish the post-scan key set after every scheduled scan.
	///
	/// Publishing never blocks: if the receiver is full or gone the update is
	/// dropped.
	pub fn with_results_channel(mut self, tx: mpsc::Sender<Vec<CryptoKey>>) -> Self {
		self.results_tx = Some(tx);
		self
	}

	pub fn features(&self) -> impl Iterator<Item = CryptoKeyFeature> + '_ {
		self.plan.features.iter().copied()
	}

	pub fn scan_interval(&self) -> Duration {
		self.scan_interval
	}

	/// Scan at the clock's current time.
	pub async fn rotate_keys(&self) -> KeyRotateResult<Vec<CryptoKey>> {
		self.scan(db_time(self.clock.now())).await
	}

	/// Bring every managed feature's keys up to date as of `now`.
	///
	/// # Returns
	/// The managed keys that exist once the scan has committed, ordered by
	/// feature then sequence.
	///
	/// # Errors
	/// Any store or secret generation failure aborts the whole scan; nothing
	/// it wrote is kept.
	#[instrument(skip(self), fields(now = %now.to_rfc3339()))]
	pub async fn scan(&self, now: DateTime<Utc>) -> KeyRotateResult<Vec<CryptoKey>> {
		let plan = Arc::clone(&self.plan);

		let (keys, summary) = self
			.repo
			.read_modify_update(move |mut tx| {
				let plan = Arc::clone(&plan);
				async move { plan.apply(&mut tx, now, &mut OsRng).await }.boxed()
			})
			.await?;

		if summary.rotated + summary.deleted + summary.bootstrapped > 0 {
			info!(
				rotated = summary.rotated,
				deleted = summary.deleted,
				bootstrapped = summary.bootstrapped,
				keys = keys.len(),
				"crypto key scan applied changes"
			);
		} else {
			tracing::debug!(keys = keys.len(), "crypto key scan found nothing to do");
		}

		Ok(keys)
	}
}

impl ScanPlan {
	async fn apply<R: RngCore + Send>(
		&self,
		tx: &mut CryptoKeyTx<'_>,
		now: DateTime<Utc>,
		rng: &mut R,
	) -> KeyRotateResult<(Vec<CryptoKey>, ScanSummary)> {
		let keys = self.managed(
			tx.list_crypto_keys()
				.await
				.map_err(KeyRotateError::store("list crypto keys"))?,
		);

		let mut summary = ScanSummary::default();
		let mut max_sequence: BTreeMap<CryptoKeyFeature, i32> = BTreeMap::new();
		let mut has_current: BTreeSet<CryptoKeyFeature> = BTreeSet::new();

		for key in &keys {
			let max = max_sequence.entry(key.feature).or_insert(key.sequence);
			*max = (*max).max(key.sequence);

			match classify(key, now, &self.policy) {
				KeyAction::NoOp => {
					if key.is_current() {
						has_current.insert(key.feature);
					}
				}
				KeyAction::Delete => {
					tx.delete_crypto_key(key.feature, key.sequence)
						.await
						.map_err(KeyRotateError::store(format!(
							"delete key {}/{}",
							key.feature, key.sequence
						)))?;
					summary.deleted += 1;
				}
				KeyAction::Rotate => {
					self.rotate(tx, key, rng).await?;
					has_current.insert(key.feature);
					summary.rotated += 1;
				}
			}
		}

		for feature in &self.features {
			if has_current.contains(feature) {
				continue;
			}
			let sequence = max_sequence.get(feature).map_or(1, |max| max + 1);
			self.bootstrap(tx, *feature, sequence, now, rng).await?;
			summary.bootstrapped += 1;
		}

		let keys = self.managed(
			tx.list_crypto_keys()
				.await
				.map_err(KeyRotateError::store("list crypto keys after scan"))?,
		);

		Ok((keys, summary))
	}

	/// Issue `key`'s successor, starting the moment `key` stops signing, and
	/// schedule `key` for deletion once its last token has expired.
	async fn rotate<R: RngCore + Send>(
		&self,
		tx: &mut CryptoKeyTx<'_>,
		key: &CryptoKey,
		rng: &mut R,
	) -> KeyRotateResult<()> {
		let new_starts_at = key.expires_at(self.policy.key_duration);
		let next = key.sequence + 1;

		let secret = generate_secret_from(rng, &self.policy.features, key.feature)?;
		tx.insert_crypto_key(&InsertCryptoKeyParams {
			feature: key.feature,
			sequence: next,
			secret,
			starts_at: new_starts_at,
		})
		.await
		.map_err(KeyRotateError::store(format!(
			"insert key {}/{}",
			key.feature, next
		)))?;

		let deletes_at = self.policy.deletes_at(key.feature, new_starts_at)?;
		tx.update_crypto_key_deletes_at(&UpdateCryptoKeyDeletesAtParams {
			feature: key.feature,
			sequence: key.sequence,
			deletes_at,
		})
		.await
		.map_err(KeyRotateError::store(format!(
			"set deletes_at on key {}/{}",
			key.feature, key.sequence
		)))?;

		info!(
			feature = %key.feature,
			retired = key.sequence,
			sequence = next,
			starts_at = %new_starts_at.to_rfc3339(),
			deletes_at = %deletes_at.to_rfc3339(),
			"rotated crypto key"
		);
		Ok(())
	}

	async fn bootstrap<R: RngCore + Send>(
		&self,
		tx: &mut CryptoKeyTx<'_>,
		feature: CryptoKeyFeature,
		sequence: i32,
		now: DateTime<Utc>,
		rng: &mut R,
	) -> KeyRotateResult<()> {
		let secret = generate_secret_from(rng, &self.policy.features, feature)?;
		tx.insert_crypto_key(&InsertCryptoKeyParams {
			feature,
			sequence,
			secret,
			starts_at: now,
		})
		.await
		.map_err(KeyRotateError::store(format!(
			"insert key {feature}/{sequence}"
		)))?;

		info!(feature = %feature, sequence, "created crypto key for feature without a current key");
		Ok(())
	}

	fn managed(&self, keys: Vec<CryptoKey>) -> Vec<CryptoKey> {
		keys.into_iter()
			.filter(|key| self.features.contains(&key.feature))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::MockClock;
	use crate::secret::ExhaustedRng;
	use chrono::TimeZone;
	use loom_server_db::testing::create_crypto_key_test_pool;

	fn t0() -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2025, 4, 1, 9, 30, 0).unwrap()
	}

	async fn make_rotator(features: &[CryptoKeyFeature]) -> (KeyRotator, CryptoKeyRepository) {
		let repo = CryptoKeyRepository::new(create_crypto_key_test_pool().await);
		let config = KeyRotatorConfig {
			key_duration: Duration::from_secs(7 * 24 * 3600),
			features: features.to_vec(),
			..Default::default()
		};
		let rotator = KeyRotator::new(repo.clone(), &config)
			.unwrap()
			.with_clock(Arc::new(MockClock::new(t0())));
		(rotator, repo)
	}

	#[tokio::test]
	async fn first_scan_bootstraps_each_feature() {
		let (rotator, repo) = make_rotator(&CryptoKeyFeature::ALL).await;

		let keys = rotator.rotate_keys().await.unwrap();

		assert_eq!(keys.len(), 3);
		for key in &keys {
			assert_eq!(key.sequence, 1);
			assert_eq!(key.starts_at, t0());
			assert!(key.deletes_at.is_none());
		}
		assert_eq!(repo.get_crypto_keys().await.unwrap(), keys);
	}

	#[tokio::test]
	async fn second_scan_is_a_no_op() {
		let (rotator, _repo) = make_rotator(&[CryptoKeyFeature::OidcConvert]).await;

		let first = rotator.scan(t0()).await.unwrap();
		let second = rotator.scan(t0() + chrono::Duration::days(1)).await.unwrap();

		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn rotation_hands_over_at_expiry() {
		let (rotator, _repo) = make_rotator(&[CryptoKeyFeature::OidcConvert]).await;
		rotator.scan(t0()).await.unwrap();

		let now = t0() + chrono::Duration::days(7) - chrono::Duration::minutes(59);
		let keys = rotator.scan(now).await.unwrap();

		assert_eq!(keys.len(), 2);
		let expiry = t0() + chrono::Duration::days(7);
		assert_eq!(
			keys[0].deletes_at,
			Some(expiry + chrono::Duration::minutes(5) + chrono::Duration::hours(1))
		);
		assert_eq!(keys[1].sequence, 2);
		assert_eq!(keys[1].starts_at, expiry);
		assert!(keys[1].is_current());
	}

	#[tokio::test]
	async fn feature_with_only_retired_keys_gets_next_sequence() {
		let (rotator, repo) = make_rotator(&[CryptoKeyFeature::PeerReconnect]).await;
		let far = t0() + chrono::Duration::days(3);

		repo.read_modify_update(move |mut tx| {
			Box::pin(async move {
				for sequence in [1, 2] {
					tx.insert_crypto_key(&InsertCryptoKeyParams {
						feature: CryptoKeyFeature::PeerReconnect,
						sequence,
						secret: "ab".repeat(64),
						starts_at: t0(),
					})
					.await?;
					tx.update_crypto_key_deletes_at(&UpdateCryptoKeyDeletesAtParams {
						feature: CryptoKeyFeature::PeerReconnect,
						sequence,
						deletes_at: far,
					})
					.await?;
				}
				Ok::<_, KeyRotateError>(())
			})
		})
		.await
		.unwrap();

		let keys = rotator.scan(t0()).await.unwrap();

		assert_eq!(keys.len(), 3);
		assert_eq!(keys[2].sequence, 3);
		assert!(keys[2].is_current());
		assert_eq!(keys[2].starts_at, t0());
	}

	#[tokio::test]
	async fn unmanaged_features_are_untouched() {
		let (rotator, repo) = make_rotator(&[CryptoKeyFeature::WorkspaceApps]).await;

		let keys = rotator.scan(t0()).await.unwrap();

		assert_eq!(keys.len(), 1);
		assert_eq!(keys[0].feature, CryptoKeyFeature::WorkspaceApps);
		assert!(repo
			.get_crypto_keys_by_feature(CryptoKeyFeature::OidcConvert)
			.await
			.unwrap()
			.is_empty());
		assert_eq!(
			rotator.features().collect::<Vec<_>>(),
			vec![CryptoKeyFeature::WorkspaceApps]
		);
	}

	async fn scan_with_rng(
		rotator: &KeyRotator,
		now: DateTime<Utc>,
		successes: usize,
	) -> KeyRotateResult<(Vec<CryptoKey>, ScanSummary)> {
		let plan = Arc::clone(&rotator.plan);
		rotator
			.repo
			.read_modify_update(move |mut tx| {
				let plan = Arc::clone(&plan);
				async move {
					let mut rng = ExhaustedRng {
						remaining: successes,
					};
					plan.apply(&mut tx, now, &mut rng).await
				}
				.boxed()
			})
			.await
	}

	#[tokio::test]
	async fn entropy_failure_during_bootstrap_commits_nothing() {
		let (rotator, repo) = make_rotator(&CryptoKeyFeature::ALL).await;

		let err = scan_with_rng(&rotator, t0(), 1).await.unwrap_err();

		assert!(matches!(err, KeyRotateError::SecretGeneration { .. }), "{err:?}");
		assert!(!err.is_transient());
		assert!(repo.get_crypto_keys().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn entropy_failure_during_rotation_rolls_back_earlier_rotations() {
		let (rotator, repo) = make_rotator(&CryptoKeyFeature::ALL).await;
		let seeded = rotator.scan(t0()).await.unwrap();

		// oidc_convert rotates with the one good draw; peer_reconnect then fails.
		let now = t0() + chrono::Duration::days(7) - chrono::Duration::minutes(59);
		let err = scan_with_rng(&rotator, now, 1).await.unwrap_err();

		match &err {
			KeyRotateError::SecretGeneration { feature, .. } => {
				assert_eq!(feature, "peer_reconnect")
			}
			other => panic!("expected SecretGeneration, got {other:?}"),
		}
		assert_eq!(repo.get_crypto_keys().await.unwrap(), seeded);

		let keys = rotator.scan(now).await.unwrap();
		assert_eq!(keys.len(), 6);
	}

	#[tokio::test]
	async fn invalid_config_is_rejected() {
		let repo = CryptoKeyRepository::new(create_crypto_key_test_pool().await);
		let config = KeyRotatorConfig {
			scan_interval: Duration::ZERO,
			..Default::default()
		};
		assert!(matches!(
			KeyRotator::new(repo, &config),
			Err(KeyRotateError::Configuration(_))
		));
	}
}
