// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! # loom-server-keyrotate
//!
//! Lifecycle management for the symmetric secrets that sign Loom's
//! short-lived tokens (workspace app sessions, OIDC conversion, peer
//! reconnection).
//!
//! Each feature owns a chain of keys. The current key signs new tokens for
//! `key_duration`; shortly before it expires a successor is issued that starts
//! exactly where it stops, and the old key is kept just long enough to verify
//! the last token it could have signed.
//!
//! ## Components
//!
//! - [`Clock`]: injected time source ([`SystemClock`], [`MockClock`])
//! - [`generate_secret`]: fixed-length CSPRNG secrets per feature
//! - [`classify`]: decides [`KeyAction`] for one key at one instant
//! - [`KeyRotator::scan`]: applies every decision in one transaction
//! - [`KeyRotator::start`]: the periodic loop, stopped by a
//!   `CancellationToken`
//!
//! ## Usage
//!
//! ```rust,ignore
//! let repo = CryptoKeyRepository::new(create_pool(&database_url).await?);
//! let config = KeyRotatorConfig::from_env()?;
//! let rotator = Arc::new(KeyRotator::new(repo, &config)?);
//!
//! let cancel = CancellationToken::new();
//! let handle = rotator.spawn(cancel.clone());
//! // ...
//! cancel.cancel();
//! handle.await?;
//! ```
//!
//! Several replicas may run the loop against one database. Each scan is a
//! single transaction that is replayed when another replica commits first,
//! so every rotation event inserts exactly one successor.

mod clock;
mod config;
mod decision;
mod error;
mod policy;
mod rotator;
mod scheduler;
mod secret;

pub use clock::{db_time, Clock, MockClock, SystemClock};
pub use config::KeyRotatorConfig;
pub use decision::{classify, KeyAction};
pub use error::{KeyRotateError, KeyRotateResult};
pub use policy::{
	FeaturePolicies, FeaturePolicy, RotationPolicy, OIDC_CONVERT_SECRET_LEN,
	OIDC_CONVERT_TOKEN_LIFETIME_SECS, PEER_RECONNECT_SECRET_LEN,
	PEER_RECONNECT_TOKEN_LIFETIME_SECS, WORKSPACE_APPS_SECRET_LEN,
	WORKSPACE_APPS_TOKEN_LIFETIME_SECS,
};
pub use rotator::KeyRotator;
pub use secret::generate_secret;
