// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Bundle ID: the ed25519 public key that signs every version of a bundle's
/// manifest.  Content-addresses the bundle across all versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId(pub [u8; 32]);

/// Subscriber ID: overlay identity of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(pub [u8; 32]);

/// Content address of a payload blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; 32]);

impl BundleId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The bundle id doubles as the manifest's verifying key.
    pub fn verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(&self.0)?)
    }

    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        prefix.len() <= self.0.len() && self.0[..prefix.len()] == *prefix
    }
}

impl Sid {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PayloadHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}
