// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the key rotator.
//!
//! This module handles loading and validating:
//! - Key validity window and scan interval
//! - Rotation and deletion safety margins
//! - The set of features whose keys are managed

use std::time::Duration;

use loom_server_db::CryptoKeyFeature;
use tracing::instrument;

use crate::error::{KeyRotateError, KeyRotateResult};
use crate::policy::{FeaturePolicies, RotationPolicy};

/// Default key validity window (30 days).
const DEFAULT_KEY_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Maximum key validity window (1 year).
const MAX_KEY_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Default interval between scans (10 minutes).
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 600;

/// Default lead time before expiry at which keys rotate (1 hour).
const DEFAULT_ROTATION_MARGIN_SECS: u64 = 3600;

/// Default retention past the longest token lifetime (1 hour).
const DEFAULT_DELETION_MARGIN_SECS: u64 = 3600;

/// Margins longer than this are almost certainly a unit mistake (1 week).
const MAX_MARGIN_SECS: u64 = 7 * 24 * 60 * 60;

const ENV_KEY_DURATION: &str = "LOOM_SERVER_KEY_ROTATION_KEY_DURATION_SECS";
const ENV_SCAN_INTERVAL: &str = "LOOM_SERVER_KEY_ROTATION_SCAN_INTERVAL_SECS";
const ENV_ROTATION_MARGIN: &str = "LOOM_SERVER_KEY_ROTATION_ROTATION_MARGIN_SECS";
const ENV_DELETION_MARGIN: &str = "LOOM_SERVER_KEY_ROTATION_DELETION_MARGIN_SECS";
const ENV_FEATURES: &str = "LOOM_SERVER_KEY_ROTATION_FEATURES";

/// Configuration for [`KeyRotator`](crate::KeyRotator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotatorConfig {
	/// How long each key may sign new tokens.
	pub key_duration: Duration,

	/// Time between scans.
	pub scan_interval: Duration,

	/// Rotate this long before a key expires, covering clock skew between
	/// replicas and the delay before they pick up the new key.
	pub rotation_margin: Duration,

	/// Keep a retired key this long past the last token it could have signed.
	pub deletion_margin: Duration,

	/// Features whose keys are managed. Others are left untouched.
	pub features: Vec<CryptoKeyFeature>,

	/// Secret length and token lifetime per feature.
	pub feature_policies: FeaturePolicies,
}

impl Default for KeyRotatorConfig {
	fn default() -> Self {
		Self {
			key_duration: Duration::from_secs(DEFAULT_KEY_DURATION_SECS),
			scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
			rotation_margin: Duration::from_secs(DEFAULT_ROTATION_MARGIN_SECS),
			deletion_margin: Duration::from_secs(DEFAULT_DELETION_MARGIN_SECS),
			features: CryptoKeyFeature::ALL.to_vec(),
			feature_policies: FeaturePolicies::default(),
		}
	}
}

impl KeyRotatorConfig {
	/// Load configuration from environment variables.
	///
	/// Environment variables:
	/// - `LOOM_SERVER_KEY_ROTATION_KEY_DURATION_SECS` - Key validity (default: 30 days)
	/// - `LOOM_SERVER_KEY_ROTATION_SCAN_INTERVAL_SECS` - Scan interval (default: 600)
	/// - `LOOM_SERVER_KEY_ROTATION_ROTATION_MARGIN_SECS` - Rotation lead time (default: 3600)
	/// - `LOOM_SERVER_KEY_ROTATION_DELETION_MARGIN_SECS` - Extra retention (default: 3600)
	/// - `LOOM_SERVER_KEY_ROTATION_FEATURES` - Comma-separated feature tags (default: all)
	#[instrument(skip_all)]
	pub fn from_env() -> KeyRotateResult<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> KeyRotateResult<Self> {
		let defaults = Self::default();

		let config = Self {
			key_duration: secs_var(&lookup, ENV_KEY_DURATION)?.unwrap_or(defaults.key_duration),
			scan_interval: secs_var(&lookup, ENV_SCAN_INTERVAL)?.unwrap_or(defaults.scan_interval),
			rotation_margin: secs_var(&lookup, ENV_ROTATION_MARGIN)?
				.unwrap_or(defaults.rotation_margin),
			deletion_margin: secs_var(&lookup, ENV_DELETION_MARGIN)?
				.unwrap_or(defaults.deletion_margin),
			features: match lookup(ENV_FEATURES).filter(|v| !v.trim().is_empty()) {
				Some(value) => parse_features(&value)?,
				None => defaults.features,
			},
			feature_policies: defaults.feature_policies,
		};

		config.validate()?;
		Ok(config)
	}

	/// Check the settings are coherent.
	pub fn validate(&self) -> KeyRotateResult<()> {
		if self.scan_interval.is_zero() {
			return Err(KeyRotateError::Configuration(
				"scan interval must be greater than zero".to_string(),
			));
		}

		if self.key_duration.as_secs() > MAX_KEY_DURATION_SECS {
			return Err(KeyRotateError::Configuration(format!(
				"key duration must be at most {MAX_KEY_DURATION_SECS} seconds"
			)));
		}

		if self.rotation_margin.as_secs() > MAX_MARGIN_SECS
			|| self.deletion_margin.as_secs() > MAX_MARGIN_SECS
		{
			return Err(KeyRotateError::Configuration(format!(
				"rotation and deletion margins must be at most {MAX_MARGIN_SECS} seconds"
			)));
		}

		// A key that is already inside the rotation margin when it starts would
		// be replaced on every scan.
		if self.key_duration <= self.rotation_margin {
			return Err(KeyRotateError::Configuration(format!(
				"key duration ({}s) must be greater than the rotation margin ({}s)",
				self.key_duration.as_secs(),
				self.rotation_margin.as_secs()
			)));
		}

		if self.features.is_empty() {
			return Err(KeyRotateError::Configuration(
				"at least one feature must be managed".to_string(),
			));
		}

		for feature in &self.features {
			self.feature_policies.get(*feature)?;
		}

		Ok(())
	}

	/// The timing and per-feature policy the rotator evaluates keys against.
	pub fn rotation_policy(&self) -> KeyRotateResult<RotationPolicy> {
		Ok(RotationPolicy {
			key_duration: to_chrono(self.key_duration, "key duration")?,
			rotation_margin: to_chrono(self.rotation_margin, "rotation margin")?,
			deletion_margin: to_chrono(self.deletion_margin, "deletion margin")?,
			features: self.feature_policies.clone(),
		})
	}

	/// Managed features, sorted and without duplicates.
	pub fn managed_features(&self) -> Vec<CryptoKeyFeature> {
		let mut features = self.features.clone();
		features.sort();
		features.dedup();
		features
	}
}

fn secs_var(
	lookup: &impl Fn(&str) -> Option<String>,
	name: &str,
) -> KeyRotateResult<Option<Duration>> {
	match lookup(name) {
		None => Ok(None),
		Some(value) => value
			.trim()
			.parse::<u64>()
			.map(|secs| Some(Duration::from_secs(secs)))
			.map_err(|e| KeyRotateError::Configuration(format!("invalid {name}={value}: {e}"))),
	}
}

fn parse_features(value: &str) -> KeyRotateResult<Vec<CryptoKeyFeature>> {
	value
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|tag| {
			tag.parse::<CryptoKeyFeature>()
				.map_err(|_| KeyRotateError::UnknownFeature(tag.to_string()))
		})
		.collect()
}

fn to_chrono(duration: Duration, what: &str) -> KeyRotateResult<chrono::Duration> {
	chrono::Duration::from_std(duration)
		.map_err(|e| KeyRotateError::Configuration(format!("{what} out of range: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |name| vars.get(name).cloned()
	}

	#[test]
	fn defaults_are_valid() {
		let config = KeyRotatorConfig::default();
		config.validate().unwrap();
		assert_eq!(config.features.len(), CryptoKeyFeature::ALL.len());
		assert_eq!(config.rotation_margin, Duration::from_secs(3600));
		assert_eq!(config.deletion_margin, Duration::from_secs(3600));
	}

	#[test]
	fn empty_environment_gives_defaults() {
		let config = KeyRotatorConfig::from_lookup(lookup_from(&[])).unwrap();
		assert_eq!(config, KeyRotatorConfig::default());
	}

	#[test]
	fn environment_overrides_defaults() {
		let config = KeyRotatorConfig::from_lookup(lookup_from(&[
			(ENV_KEY_DURATION, "604800"),
			(ENV_SCAN_INTERVAL, "30"),
			(ENV_ROTATION_MARGIN, "1800"),
			(ENV_DELETION_MARGIN, "7200"),
			(ENV_FEATURES, "oidc_convert, workspace_apps"),
		]))
		.unwrap();

		assert_eq!(config.key_duration, Duration::from_secs(604_800));
		assert_eq!(config.scan_interval, Duration::from_secs(30));
		assert_eq!(config.rotation_margin, Duration::from_secs(1800));
		assert_eq!(config.deletion_margin, Duration::from_secs(7200));
		assert_eq!(
			config.features,
			vec![CryptoKeyFeature::OidcConvert, CryptoKeyFeature::WorkspaceApps]
		);
	}

	#[test]
	fn unknown_feature_in_environment_fails() {
		let err = KeyRotatorConfig::from_lookup(lookup_from(&[(ENV_FEATURES, "workspace_apps,tailnet")]))
			.unwrap_err();
		assert!(matches!(err, KeyRotateError::UnknownFeature(ref tag) if tag == "tailnet"));
	}

	#[test]
	fn unparseable_duration_fails() {
		let err = KeyRotatorConfig::from_lookup(lookup_from(&[(ENV_SCAN_INTERVAL, "10m")]))
			.unwrap_err();
		assert!(err.to_string().contains(ENV_SCAN_INTERVAL));
	}

	#[test]
	fn zero_scan_interval_is_rejected() {
		let config = KeyRotatorConfig {
			scan_interval: Duration::ZERO,
			..Default::default()
		};
		assert!(config.validate().unwrap_err().to_string().contains("scan interval"));
	}

	#[test]
	fn key_duration_must_exceed_rotation_margin() {
		let config = KeyRotatorConfig {
			key_duration: Duration::from_secs(3600),
			..Default::default()
		};
		assert!(config.validate().unwrap_err().to_string().contains("rotation margin"));
	}

	#[test]
	fn oversized_key_duration_is_rejected() {
		let config = KeyRotatorConfig {
			key_duration: Duration::from_secs(MAX_KEY_DURATION_SECS + 1),
			..Default::default()
		};
		assert!(config.validate().unwrap_err().to_string().contains("at most"));
	}

	#[test]
	fn empty_feature_set_is_rejected() {
		let config = KeyRotatorConfig {
			features: vec![],
			..Default::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn managed_features_are_deduplicated() {
		let config = KeyRotatorConfig {
			features: vec![
				CryptoKeyFeature::PeerReconnect,
				CryptoKeyFeature::WorkspaceApps,
				CryptoKeyFeature::PeerReconnect,
			],
			..Default::default()
		};
		assert_eq!(
			config.managed_features(),
			vec![CryptoKeyFeature::WorkspaceApps, CryptoKeyFeature::PeerReconnect]
		);
	}

	#[test]
	fn rotation_policy_converts_durations() {
		let config = KeyRotatorConfig {
			key_duration: Duration::from_secs(7 * 24 * 3600),
			..Default::default()
		};
		let policy = config.rotation_policy().unwrap();
		assert_eq!(policy.key_duration, chrono::Duration::days(7));
		assert_eq!(policy.rotation_margin, chrono::Duration::hours(1));
		assert_eq!(policy.deletion_margin, chrono::Duration::hours(1));
	}
}
