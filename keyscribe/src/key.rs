// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Loading and generating the key pair a certificate is issued for.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::rngs::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey};

use crate::error::KeyError;

/// The algorithm used for ad-hoc key pairs.
pub const GENERATED_KEY_ALGORITHM: Algorithm = Algorithm::Ed25519;

/// A private key and its public half.
///
/// Cloning is cheap; the private key is shared.
#[derive(Clone)]
pub struct KeyPair {
    private_key: Arc<PrivateKey>,
    generated: bool,
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.private_key.algorithm())
            .field("fingerprint", &self.fingerprint())
            .field("generated", &self.generated)
            .finish()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key().key_data() == other.public_key().key_data()
    }
}

impl KeyPair {
    fn new(private_key: PrivateKey, generated: bool) -> Self {
        Self {
            private_key: Arc::new(private_key),
            generated,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    /// Whether the key was generated for this login rather than loaded from an identity file.
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// The SHA-256 fingerprint of the public key, as printed by `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// The private key in the OpenSSH format, unencrypted.
    pub fn private_key_openssh(&self) -> Result<String, KeyError> {
        self.private_key
            .to_openssh(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(KeyError::Encoding)
    }

    /// The public key in the `authorized_keys` format.
    pub fn public_key_openssh(&self) -> Result<String, KeyError> {
        self.public_key().to_openssh().map_err(KeyError::Encoding)
    }
}

/// Produces the key pair for a login.
#[derive(Clone, Default)]
pub struct KeySource {
    passphrase: Option<String>,
}

impl Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySource")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KeySource {
    /// Create a key source. The passphrase, if any, is used to decrypt encrypted identity files.
    pub fn new(passphrase: Option<String>) -> Self {
        Self { passphrase }
    }

    /// Obtain a key pair.
    ///
    /// If `generate` is set, a new Ed25519 key is created in memory and `identity_path` is
    /// ignored; nothing is written to disk. Otherwise the key is loaded from `identity_path`.
    ///
    /// # Errors
    ///
    /// When loading, [`KeyError::NotFound`] is returned if the file (or the path itself) is
    /// missing, [`KeyError::Format`] if it's not an OpenSSH private key, and
    /// [`KeyError::Passphrase`] if it's encrypted and can't be decrypted.
    pub fn obtain(
        &self,
        identity_path: Option<&Path>,
        generate: bool,
    ) -> Result<KeyPair, KeyError> {
        if generate {
            let private_key = PrivateKey::random(&mut OsRng, GENERATED_KEY_ALGORITHM)
                .map_err(KeyError::Generate)?;
            let key = KeyPair::new(private_key, true);
            tracing::debug!(fingerprint = %key.fingerprint(), "Generated ad-hoc key pair");
            return Ok(key);
        }

        let path = identity_path.ok_or(KeyError::NotFound { path: None })?;
        let private_key = self.load(path)?;
        let key = KeyPair::new(private_key, false);
        tracing::debug!(
            path = %path.display(),
            fingerprint = %key.fingerprint(),
            "Loaded identity"
        );
        Ok(key)
    }

    fn load(&self, path: &Path) -> Result<PrivateKey, KeyError> {
        let contents = std::fs::read(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => KeyError::NotFound {
                path: Some(path.to_path_buf()),
            },
            _ => KeyError::Io {
                path: path.to_path_buf(),
                source: error,
            },
        })?;
        let private_key = PrivateKey::from_openssh(&contents).map_err(|source| KeyError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        if !private_key.is_encrypted() {
            return Ok(private_key);
        }

        let passphrase_error = || KeyError::Passphrase {
            path: PathBuf::from(path),
        };
        let passphrase = self.passphrase.as_deref().ok_or_else(passphrase_error)?;
        private_key.decrypt(passphrase).map_err(|error| {
            tracing::debug!(?error, path = %path.display(), "Failed to decrypt identity file");
            passphrase_error()
        })
    }
}
