// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Classification of a single key at a point in time.

use chrono::{DateTime, Utc};
use loom_server_db::CryptoKey;

use crate::policy::RotationPolicy;

/// What a scan must do with one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
	NoOp,
	/// Current key is about to stop signing; issue its successor and retire it.
	Rotate,
	/// Retired key has outlived every token it could have signed.
	Delete,
}

/// Decide the fate of `key` at `now`.
///
/// Retired keys (`deletes_at` set) are only ever deleted, never rotated. A
/// current key rotates once `now + rotation_margin` reaches its expiry.
pub fn classify(key: &CryptoKey, now: DateTime<Utc>, policy: &RotationPolicy) -> KeyAction {
	match key.deletes_at {
		Some(deletes_at) if now >= deletes_at => KeyAction::Delete,
		Some(_) => KeyAction::NoOp,
		None if now + policy.rotation_margin >= key.expires_at(policy.key_duration) => {
			KeyAction::Rotate
		}
		None => KeyAction::NoOp,
	}
}
