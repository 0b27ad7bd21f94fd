// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A throwaway certificate authority for unit tests.

use std::{
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{rngs::OsRng, RngCore};
use ssh_key::{
    certificate::{Builder, CertType},
    Algorithm, Certificate, PrivateKey, PublicKey,
};

fn ca_key() -> &'static PrivateKey {
    static CA: OnceLock<PrivateKey> = OnceLock::new();
    CA.get_or_init(|| {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("ed25519 keys can be generated")
    })
}

/// Issue a user certificate for `public_key` that expires at `valid_before`.
pub(crate) fn issue(
    public_key: &PublicKey,
    principals: &[&str],
    valid_before: SystemTime,
) -> anyhow::Result<Certificate> {
    let valid_before = valid_before.duration_since(UNIX_EPOCH)?.as_secs();
    let valid_after = valid_before.saturating_sub(3600);
    let mut builder =
        Builder::new_with_random_nonce(&mut OsRng, public_key, valid_after, valid_before)?;
    builder.serial(OsRng.next_u64())?;
    builder.key_id("keyscribe-test")?;
    builder.cert_type(CertType::User)?;
    for principal in principals {
        builder.valid_principal(*principal)?;
    }
    Ok(builder.sign(ca_key())?)
}
