// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key material generation.

use loom_server_db::CryptoKeyFeature;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{KeyRotateError, KeyRotateResult};
use crate::policy::FeaturePolicies;

/// Generate a hex-encoded secret of the feature's fixed length.
///
/// Bytes come straight from the operating system's CSPRNG. If it fails the
/// error is returned; there is no fallback source.
pub fn generate_secret(
	policies: &FeaturePolicies,
	feature: CryptoKeyFeature,
) -> KeyRotateResult<String> {
	generate_secret_from(&mut OsRng, policies, feature)
}

/// Same as [`generate_secret`], drawing from `rng`.
pub(crate) fn generate_secret_from<R: RngCore + ?Sized>(
	rng: &mut R,
	policies: &FeaturePolicies,
	feature: CryptoKeyFeature,
) -> KeyRotateResult<String> {
	let len = policies.secret_len(feature)?;
	generate_key(rng, feature, len)
}

fn generate_key<R: RngCore + ?Sized>(
	rng: &mut R,
	feature: CryptoKeyFeature,
	len: usize,
) -> KeyRotateResult<String> {
	if len == 0 {
		return Err(KeyRotateError::SecretGeneration {
			feature: feature.to_string(),
			message: "refusing to generate an empty secret".to_string(),
		});
	}

	let mut bytes = Zeroizing::new(vec![0u8; len]);
	rng.try_fill_bytes(bytes.as_mut_slice())
		.map_err(|e| KeyRotateError::SecretGeneration {
			feature: feature.to_string(),
			message: format!("rand read: {e}"),
		})?;

	Ok(hex::encode(bytes.as_slice()))
}

/// Entropy source that succeeds a fixed number of times and then fails.
#[cfg(test)]
pub(crate) struct ExhaustedRng {
	pub(crate) remaining: usize,
}

#[cfg(test)]
impl RngCore for ExhaustedRng {
	fn next_u32(&mut self) -> u32 {
		0
	}

	fn next_u64(&mut self) -> u64 {
		0
	}

	fn fill_bytes(&mut self, dest: &mut [u8]) {
		dest.fill(0x5a);
	}

	fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
		if self.remaining == 0 {
			return Err(rand::Error::new(std::io::Error::new(
				std::io::ErrorKind::Other,
				"entropy source unavailable",
			)));
		}
		self.remaining -= 1;
		self.fill_bytes(dest);
		Ok(())
	}
}
