// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Time sources for key rotation.
//!
//! The rotator never reads wall-clock time directly; it asks an injected
//! [`Clock`]. Production uses [`SystemClock`], tests drive a [`MockClock`]
//! forward to cross rotation and deletion thresholds without waiting.

use chrono::{DateTime, DurationRound, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Manually driven clock. Clones share the same instant.
#[derive(Clone)]
pub struct MockClock {
	micros: Arc<AtomicI64>,
}

impl MockClock {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self {
			micros: Arc::new(AtomicI64::new(start.timestamp_micros())),
		}
	}

	pub fn set(&self, time: DateTime<Utc>) {
		self.micros.store(time.timestamp_micros(), Ordering::SeqCst);
	}

	/// Move the clock by `by` (negative values move it back). Saturates at the
	/// ends of the representable range instead of wrapping.
	pub fn advance(&self, by: chrono::Duration) -> DateTime<Utc> {
		let delta = by.num_microseconds().unwrap_or(if by < chrono::Duration::zero() {
			i64::MIN
		} else {
			i64::MAX
		});
		let mut current = self.micros.load(Ordering::SeqCst);
		loop {
			let next = current.saturating_add(delta);
			match self.micros.compare_exchange_weak(
				current,
				next,
				Ordering::SeqCst,
				Ordering::SeqCst,
			) {
				Ok(_) => return from_micros(next),
				Err(actual) => current = actual,
			}
		}
	}
}

impl Clock for MockClock {
	fn now(&self) -> DateTime<Utc> {
		from_micros(self.micros.load(Ordering::SeqCst))
	}
}

impl fmt::Debug for MockClock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MockClock").field("now", &self.now()).finish()
	}
}

fn from_micros(micros: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_micros(micros).unwrap_or(if micros < 0 {
		DateTime::<Utc>::MIN_UTC
	} else {
		DateTime::<Utc>::MAX_UTC
	})
}

/// Truncate to the microsecond precision timestamps are stored with, so an
/// instant compares equal to itself after a trip through the database.
pub fn db_time(time: DateTime<Utc>) -> DateTime<Utc> {
	time.duration_trunc(chrono::Duration::microseconds(1))
		.unwrap_or(time)
}
