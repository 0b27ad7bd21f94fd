// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Delivering a login result to files and/or an ssh-agent.
//!
//! Files follow OpenSSH's naming convention: for an identity file `id_ed25519`, the public key is
//! `id_ed25519.pub` and the certificate is `id_ed25519-cert.pub`. Every file is written to a
//! temporary file in the same directory and renamed into place, so a crash never leaves a partially
//! written key or certificate behind.

use std::{
    ffi::OsString,
    fmt::Display,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use crate::{
    agent::AgentStore,
    client::LoginResult,
    error::{AgentError, DeliveryError, StorageError},
};

/// The path of the public key that belongs to the private key at `key_path`.
pub fn public_key_path(key_path: &Path) -> PathBuf {
    with_suffix(key_path, ".pub")
}

/// The path of the certificate that belongs to the private key at `key_path`.
pub fn certificate_path(key_path: &Path) -> PathBuf {
    with_suffix(key_path, "-cert.pub")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(path.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// A place a login result was delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    PrivateKey(PathBuf),
    PublicKey(PathBuf),
    Certificate(PathBuf),
    Agent,
    /// Nothing was written; the result lives only in this process's cache.
    Memory,
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::PrivateKey(path) => write!(f, "private key written to {}", path.display()),
            Destination::PublicKey(path) => write!(f, "public key written to {}", path.display()),
            Destination::Certificate(path) => {
                write!(f, "certificate written to {}", path.display())
            }
            Destination::Agent => write!(f, "key and certificate added to the ssh-agent"),
            Destination::Memory => write!(f, "certificate kept in memory only"),
        }
    }
}

/// The destinations a result was successfully delivered to, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<Destination>,
}

impl Display for DeliveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.delivered.is_empty() {
            return write!(f, "nothing delivered");
        }
        let lines = self
            .delivered
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", lines.join("; "))
    }
}

/// Writes key material and certificates to their destinations.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    agent: Option<Arc<dyn AgentStore>>,
}

impl OutputSink {
    /// Create a sink. `agent` is `None` when no agent is reachable from this process.
    pub fn new(agent: Option<Arc<dyn AgentStore>>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> Option<&Arc<dyn AgentStore>> {
        self.agent.as_ref()
    }

    /// Deliver `result` to files derived from `dest_path` and/or to the agent.
    ///
    /// Files are written first. The private key is only written when it was generated for this
    /// login; an existing identity file is never replaced. If the agent is unreachable or refuses
    /// the key, [`DeliveryError::Agent`] is returned along with the files that were written; those
    /// files are left in place.
    #[tracing::instrument(
        level = "debug",
        skip(self, result),
        fields(identity = %result.identity),
        err
    )]
    pub async fn deliver(
        &self,
        result: &LoginResult,
        write_to_file: bool,
        use_agent: bool,
        dest_path: Option<&Path>,
    ) -> Result<DeliveryReport, DeliveryError> {
        let mut report = DeliveryReport::default();

        if write_to_file {
            let dest_path = dest_path.ok_or(StorageError::NoDestination)?;
            write_files(result, dest_path, &mut report)?;
        }

        if use_agent {
            let lifetime = result.remaining(SystemTime::now());
            let added = match &self.agent {
                Some(agent) => {
                    agent
                        .add_identity(
                            &result.identity,
                            &result.key,
                            &result.certificate,
                            Some(lifetime),
                        )
                        .await
                }
                None => Err(AgentError::Unavailable(format!(
                    "${} is not set",
                    crate::agent::AUTH_SOCK_ENV
                ))),
            };
            match added {
                Ok(()) => {
                    tracing::info!(
                        identity = %result.identity,
                        ?lifetime,
                        "Added certificate to the ssh-agent"
                    );
                    report.delivered.push(Destination::Agent);
                }
                Err(source) => {
                    tracing::warn!(
                        error = %source,
                        "Failed to add the certificate to the ssh-agent"
                    );
                    return Err(DeliveryError::Agent { source, report });
                }
            }
        }

        if report.delivered.is_empty() {
            report.delivered.push(Destination::Memory);
        }
        Ok(report)
    }

    /// Remove the certificate written for `dest_path`, along with the key files if `remove_key`
    /// is set. Files that don't exist are skipped.
    pub fn remove(&self, dest_path: &Path, remove_key: bool) -> Result<Vec<PathBuf>, StorageError> {
        let mut paths = vec![certificate_path(dest_path)];
        if remove_key {
            paths.push(dest_path.to_path_buf());
            paths.push(public_key_path(dest_path));
        }

        let mut removed = vec![];
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed file");
                    removed.push(path);
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::Remove { path, source }),
            }
        }
        Ok(removed)
    }
}

fn write_files(
    result: &LoginResult,
    dest_path: &Path,
    report: &mut DeliveryReport,
) -> Result<(), StorageError> {
    if result.key.is_generated() {
        let private_key = result
            .key
            .private_key()
            .to_openssh(ssh_key::LineEnding::LF)?;
        write_atomic(dest_path, private_key.as_bytes(), 0o600)?;
        report
            .delivered
            .push(Destination::PrivateKey(dest_path.to_path_buf()));
    }

    let public_key_path = public_key_path(dest_path);
    if result.key.is_generated() || !public_key_path.exists() {
        let mut public_key = result.key.public_key().to_openssh()?;
        public_key.push('\n');
        write_atomic(&public_key_path, public_key.as_bytes(), 0o644)?;
        report.delivered.push(Destination::PublicKey(public_key_path));
    }

    let certificate_path = certificate_path(dest_path);
    let mut certificate = result.certificate.to_openssh()?;
    certificate.push('\n');
    write_atomic(&certificate_path, certificate.as_bytes(), 0o644)?;
    tracing::info!(path = %certificate_path.display(), "Wrote certificate");
    report.delivered.push(Destination::Certificate(certificate_path));

    Ok(())
}

// Write to a temporary file next to `path` and rename it into place.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), StorageError> {
    let write_error = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory).map_err(write_error)?;
    let mut file = tempfile::Builder::new()
        .prefix(".keyscribe")
        .tempfile_in(directory)
        .map_err(write_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(write_error)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|error| write_error(error.error))?;
    Ok(())
}
