// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Tracking issued certificates and deciding when they need renewal.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ssh_key::Certificate;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    key::{KeyPair, KeySource},
    sink,
};

/// A certificate issued for an identity, along with the key it was issued for.
#[derive(Debug, Clone)]
pub struct CachedCertificate {
    /// The name of the identity the certificate belongs to.
    pub identity: String,
    pub certificate: Certificate,
    /// The moment the certificate stops being valid.
    pub expiry: SystemTime,
    pub key: KeyPair,
    /// The file the private key lives in, if it lives anywhere other than memory.
    pub key_path: Option<PathBuf>,
    /// The endpoints that authenticated the request for this certificate.
    pub endpoints: Vec<String>,
}

impl CachedCertificate {
    pub fn new(
        identity: impl Into<String>,
        certificate: Certificate,
        key: KeyPair,
        key_path: Option<PathBuf>,
        endpoints: Vec<String>,
    ) -> Self {
        let expiry = certificate_expiry(&certificate);
        Self {
            identity: identity.into(),
            certificate,
            expiry,
            key,
            key_path,
            endpoints,
        }
    }

    /// Whether the private key backing the certificate is still available.
    pub fn key_exists(&self) -> bool {
        self.key_path.as_deref().is_none_or(Path::exists)
    }

    /// How much longer the certificate is valid for, as of `now`.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expiry.duration_since(now).unwrap_or_default()
    }
}

/// The expiry of a certificate, taken from its `valid_before` field.
///
/// Certificates valid "forever" (`valid_before` of `u64::MAX`) saturate to a point far in the
/// future.
pub fn certificate_expiry(certificate: &Certificate) -> SystemTime {
    // SystemTime can't represent u64::MAX seconds on every platform.
    let seconds = certificate.valid_before().min(i64::MAX as u64 / 2);
    UNIX_EPOCH
        .checked_add(Duration::from_secs(seconds))
        .unwrap_or_else(|| UNIX_EPOCH + Duration::from_secs(u32::MAX.into()))
}

/// Certificates issued during the lifetime of this process, keyed by identity name.
///
/// The cache also hands out a lock per identity so a login, delivery, or logout for one identity
/// never interleaves with another for the same identity.
#[derive(Debug, Default)]
pub struct CertificateCache {
    margin: Duration,
    entries: Mutex<HashMap<String, CachedCertificate>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateCache {
    /// Create a cache that treats certificates as expired `margin` before their actual expiry.
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            ..Default::default()
        }
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Serialize operations on `identity`.
    ///
    /// The returned guard must be held for the duration of the operation.
    pub async fn lock(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(identity.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// The certificate most recently stored for `identity`, if any.
    pub async fn lookup(&self, identity: &str) -> Option<CachedCertificate> {
        self.entries.lock().await.get(identity).cloned()
    }

    /// Decide whether a new certificate must be requested.
    ///
    /// This is true if renewal is forced, there's no certificate, the certificate expires within
    /// the safety margin of `now`, or the key it was issued for no longer exists.
    pub fn needs_renewal(
        &self,
        cert: Option<&CachedCertificate>,
        now: SystemTime,
        force: bool,
    ) -> bool {
        if force {
            return true;
        }
        let Some(cert) = cert else {
            return true;
        };
        let expiring = now
            .checked_add(self.margin)
            .is_none_or(|deadline| deadline >= cert.expiry);
        expiring || !cert.key_exists()
    }

    /// Replace any certificate stored for `identity`.
    pub async fn store(&self, identity: &str, cert: CachedCertificate) {
        tracing::debug!(identity, expiry = ?cert.expiry, "Caching certificate");
        self.entries.lock().await.insert(identity.to_string(), cert);
    }

    /// Forget the certificate for `identity`. Clearing an identity with nothing cached is fine.
    pub async fn clear(&self, identity: &str) {
        if self.entries.lock().await.remove(identity).is_some() {
            tracing::debug!(identity, "Cleared cached certificate");
        }
    }

    /// Rebuild a cache entry from files written by an earlier process.
    ///
    /// The certificate is read from the path [`sink::certificate_path`] derives from `key_path`;
    /// it's only accepted if it was issued for the key in `key_path`. Anything missing or
    /// unreadable is treated as nothing cached.
    pub fn load_persisted(
        &self,
        identity: &str,
        key_path: &Path,
        key_source: &KeySource,
    ) -> Option<CachedCertificate> {
        let cert_path = sink::certificate_path(key_path);
        let contents = std::fs::read_to_string(&cert_path)
            .inspect_err(|error| {
                tracing::debug!(?error, path = %cert_path.display(), "No persisted certificate");
            })
            .ok()?;
        let certificate = Certificate::from_openssh(contents.trim())
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    path = %cert_path.display(),
                    "Ignoring unreadable certificate"
                );
            })
            .ok()?;
        let key = key_source
            .obtain(Some(key_path), false)
            .inspect_err(|error| {
                tracing::debug!(?error, "Unable to load the key for the persisted certificate");
            })
            .ok()?;
        if certificate.public_key() != key.public_key().key_data() {
            tracing::info!(
                path = %cert_path.display(),
                "Persisted certificate was issued for a different key; ignoring it"
            );
            return None;
        }

        Some(CachedCertificate::new(
            identity,
            certificate,
            key,
            Some(key_path.to_path_buf()),
            vec![],
        ))
    }
}
