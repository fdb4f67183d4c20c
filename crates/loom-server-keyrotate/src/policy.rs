// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-feature key policy.
//!
//! Secret length and maximum token lifetime are fixed per feature and live in
//! one table. The table is checked for completeness when the rotator is built,
//! so a feature without an entry stops startup instead of yielding an empty
//! secret or a zero retention window at rotation time.

use chrono::Duration;
use loom_server_db::CryptoKeyFeature;
use std::collections::HashMap;

use crate::error::{KeyRotateError, KeyRotateResult};

/// Workspace application tokens: 96 random bytes, tokens live one minute.
pub const WORKSPACE_APPS_SECRET_LEN: usize = 96;
pub const WORKSPACE_APPS_TOKEN_LIFETIME_SECS: i64 = 60;

/// OIDC convert tokens: 32 random bytes, tokens live five minutes.
pub const OIDC_CONVERT_SECRET_LEN: usize = 32;
pub const OIDC_CONVERT_TOKEN_LIFETIME_SECS: i64 = 5 * 60;

/// Peer reconnect tokens: 64 random bytes, tokens live one day.
pub const PEER_RECONNECT_SECRET_LEN: usize = 64;
pub const PEER_RECONNECT_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// How a single feature's keys are generated and retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePolicy {
	/// Number of random bytes in a secret (before hex encoding).
	pub secret_len: usize,
	/// Longest validity of a token signed with this feature's key.
	pub max_token_lifetime: Duration,
}

/// Complete policy table, one entry for every [`CryptoKeyFeature`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturePolicies {
	entries: HashMap<CryptoKeyFeature, FeaturePolicy>,
}

impl FeaturePolicies {
	/// Build a table, rejecting it unless every known feature has a usable
	/// entry.
	pub fn new(
		entries: impl IntoIterator<Item = (CryptoKeyFeature, FeaturePolicy)>,
	) -> KeyRotateResult<Self> {
		let entries: HashMap<_, _> = entries.into_iter().collect();

		for feature in CryptoKeyFeature::ALL {
			let policy = entries.get(&feature).ok_or_else(|| {
				KeyRotateError::Configuration(format!("no key policy for feature {feature}"))
			})?;
			if policy.secret_len == 0 {
				return Err(KeyRotateError::Configuration(format!(
					"secret length for feature {feature} must be non-zero"
				)));
			}
			if policy.max_token_lifetime < Duration::zero() {
				return Err(KeyRotateError::Configuration(format!(
					"token lifetime for feature {feature} must not be negative"
				)));
			}
		}

		Ok(Self { entries })
	}

	pub fn get(&self, feature: CryptoKeyFeature) -> KeyRotateResult<&FeaturePolicy> {
		self
			.entries
			.get(&feature)
			.ok_or_else(|| KeyRotateError::UnknownFeature(feature.to_string()))
	}

	pub fn secret_len(&self, feature: CryptoKeyFeature) -> KeyRotateResult<usize> {
		Ok(self.get(feature)?.secret_len)
	}

	pub fn max_token_lifetime(&self, feature: CryptoKeyFeature) -> KeyRotateResult<Duration> {
		Ok(self.get(feature)?.max_token_lifetime)
	}
}

impl Default for FeaturePolicies {
	fn default() -> Self {
		let entries = CryptoKeyFeature::ALL
			.into_iter()
			.map(|feature| (feature, builtin_policy(feature)))
			.collect();
		Self { entries }
	}
}

fn builtin_policy(feature: CryptoKeyFeature) -> FeaturePolicy {
	match feature {
		CryptoKeyFeature::WorkspaceApps => FeaturePolicy {
			secret_len: WORKSPACE_APPS_SECRET_LEN,
			max_token_lifetime: Duration::seconds(WORKSPACE_APPS_TOKEN_LIFETIME_SECS),
		},
		CryptoKeyFeature::OidcConvert => FeaturePolicy {
			secret_len: OIDC_CONVERT_SECRET_LEN,
			max_token_lifetime: Duration::seconds(OIDC_CONVERT_TOKEN_LIFETIME_SECS),
		},
		CryptoKeyFeature::PeerReconnect => FeaturePolicy {
			secret_len: PEER_RECONNECT_SECRET_LEN,
			max_token_lifetime: Duration::seconds(PEER_RECONNECT_TOKEN_LIFETIME_SECS),
		},
	}
}

/// Timing policy shared by every managed feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
	/// How long a key may sign new tokens.
	pub key_duration: Duration,
	/// Rotate once `now + rotation_margin` reaches a key's expiry.
	pub rotation_margin: Duration,
	/// Extra retention past the last token a retired key could have signed.
	pub deletion_margin: Duration,
	pub features: FeaturePolicies,
}

impl RotationPolicy {
	/// Retirement time for a key superseded by one starting at
	/// `new_starts_at`.
	pub fn deletes_at(
		&self,
		feature: CryptoKeyFeature,
		new_starts_at: chrono::DateTime<chrono::Utc>,
	) -> KeyRotateResult<chrono::DateTime<chrono::Utc>> {
		let lifetime = self.features.max_token_lifetime(feature)?;
		Ok(new_starts_at + lifetime + self.deletion_margin)
	}
}
