// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic scan loop.

use std::sync::Arc;

use loom_server_db::CryptoKey;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::rotator::KeyRotator;

impl KeyRotator {
	/// Scan now and then once per scan interval until `cancel` fires.
	///
	/// Scans never overlap: a slow scan delays the next tick rather than
	/// stacking ticks up behind it. A failed scan is logged and retried on the
	/// next tick. Cancellation is observed while waiting for a tick; a scan in
	/// progress is allowed to finish.
	#[instrument(skip_all, fields(interval_secs = self.scan_interval.as_secs()))]
	pub async fn start(&self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.scan_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// The first tick completes immediately; the initial scan doesn't wait.
		ticker.tick().await;

		info!("crypto key rotator started");

		loop {
			if cancel.is_cancelled() {
				break;
			}

			match self.rotate_keys().await {
				Ok(keys) => self.publish(keys),
				Err(e) => error!(
					error = %e,
					transient = e.is_transient(),
					"crypto key scan failed"
				),
			}

			tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
		}

		info!("crypto key rotator stopped");
	}

	/// Run [`start`](Self::start) on its own task.
	pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(async move { self.start(cancel).await })
	}

	fn publish(&self, keys: Vec<CryptoKey>) {
		let Some(tx) = &self.results_tx else {
			return;
		};

		match tx.try_send(keys) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => debug!("results channel full, dropping scan result"),
			Err(TrySendError::Closed(_)) => debug!("results channel closed, dropping scan result"),
		}
	}
}
