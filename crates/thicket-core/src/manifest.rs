// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};

use crate::ids::{BundleId, PayloadHash};

/// Signing key for publishing bundles.  The derived verifying key *is* the
/// bundle id, so a bundle's identity and its signature authority are the
/// same 32 bytes.
#[derive(Debug, Clone)]
pub struct BundleKeypair {
    pub signing_key: SigningKey,
}

impl BundleKeypair {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn bundle_id(&self) -> BundleId {
        BundleId(self.signing_key.verifying_key().to_bytes())
    }
}

/// Signed descriptor of a bundle: identity, version, and the content
/// address of the payload blob it references.
///
/// `self_signed` and `verified` are local parser/verifier state, never
/// trusted from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bid: BundleId,
    /// Monotone per bundle id; higher supersedes lower.
    pub version: u64,
    pub payload_length: u64,
    /// Absent on malformed manifests; a nil payload still carries the
    /// hash of the empty blob or `None`.
    pub payload_hash: Option<PayloadHash>,
    /// Remaining store-and-forward hops.
    pub ttl: u8,
    /// Ed25519 signature by the bundle id key; always 64 bytes when present.
    #[serde(default, with = "sig_serde")]
    pub signature: Option<[u8; 64]>,
    /// Set by the local parser when the signature was already checked at
    /// parse time.  Never serialized: a peer must not be able to claim it.
    #[serde(skip)]
    pub self_signed: bool,
    #[serde(skip)]
    verified: bool,
}

/// Custom serde for `Option<[u8; 64]>`; serializes as a CBOR byte string.
mod sig_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Option<[u8; 64]>, s: S) -> Result<S::Ok, S::Error> {
        match sig {
            Some(bytes) => s.serialize_bytes(bytes),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 64]>, D::Error> {
        let opt: Option<serde_bytes::ByteBuf> = Deserialize::deserialize(d)?;
        match opt {
            Some(buf) => {
                if buf.len() != 64 {
                    return Err(serde::de::Error::custom(format!(
                        "signature must be 64 bytes, got {}",
                        buf.len()
                    )));
                }
                let mut arr = [0u8; 64];
                arr.copy_from_slice(&buf);
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

/// Signature payloads use a positional CBOR array to avoid map key
/// ordering variance.  Hop ttl is deliberately outside the signature.
#[derive(Serialize)]
struct ManifestSigningTuple<'a>([u8; 32], u64, u64, Option<&'a [u8; 32]>);

impl BundleManifest {
    pub fn new(bid: BundleId, version: u64, payload: &[u8], ttl: u8) -> Self {
        Self {
            bid,
            version,
            payload_length: payload.len() as u64,
            payload_hash: Some(PayloadHash::of_bytes(payload)),
            ttl,
            signature: None,
            self_signed: false,
            verified: false,
        }
    }

    fn signable_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let tuple = ManifestSigningTuple(
            self.bid.0,
            self.version,
            self.payload_length,
            self.payload_hash.as_ref().map(|h| &h.0),
        );
        Ok(serde_cbor::to_vec(&tuple)?)
    }

    pub fn sign(&mut self, key: &BundleKeypair) -> anyhow::Result<()> {
        if key.bundle_id() != self.bid {
            anyhow::bail!("signing key does not match bundle id");
        }
        let signature: Signature = key.signing_key.sign(&self.signable_bytes()?);
        self.signature = Some(signature.to_bytes());
        Ok(())
    }

    /// Check the manifest signature against the bundle id.  Expensive, so
    /// the result is memoized and callers defer it as late as possible.
    pub fn verify(&mut self) -> anyhow::Result<()> {
        if self.verified || self.self_signed {
            return Ok(());
        }
        let sig = self
            .signature
            .ok_or_else(|| anyhow::anyhow!("manifest missing signature"))?;
        let pubkey = self.bid.verifying_key()?;
        pubkey.verify(&self.signable_bytes()?, &Signature::from_bytes(&sig))?;
        self.verified = true;
        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}
