// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the keyscribe client and its collaborators.
//!
//! Each stage of a login has its own error type so callers can tell exactly which step failed.
//! [`ClientError`] aggregates them for the [`crate::client::Client`] operations.

use std::{path::PathBuf, time::Duration};

use crate::sink::DeliveryReport;

/// Errors produced while loading or generating key material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The identity file does not exist, or no identity file was configured and key generation
    /// was not requested.
    #[error("no identity file found{}", .path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    NotFound { path: Option<PathBuf> },

    /// The identity file exists but is not an OpenSSH private key.
    #[error("failed to parse identity file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: ssh_key::Error,
    },

    /// The identity file is encrypted and either no passphrase was provided or the passphrase
    /// was incorrect.
    #[error("identity file {path} is encrypted and could not be decrypted with the provided passphrase")]
    Passphrase { path: PathBuf },

    /// The identity file could not be read.
    #[error("failed to read identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generating a new key pair failed.
    #[error("failed to generate key pair: {0}")]
    Generate(#[source] ssh_key::Error),

    /// The key could not be encoded in the OpenSSH format.
    #[error("failed to encode key: {0}")]
    Encoding(#[source] ssh_key::Error),
}

/// A principal include or exclude pattern is not a valid glob.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PatternError {
    #[error("invalid principal pattern '{pattern}': {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Errors returned by a [`crate::transport::SigningTransport`] or
/// [`crate::transport::DiscoveryTransport`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The HTTP request failed before the service produced a response.
    ///
    /// This is very likely due to temporary networking issues. Retrying is up to the caller; the
    /// client never retries on its own.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A general I/O error occurred while talking to the service.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The service did not respond within the configured request timeout.
    #[error("no response from the service within {0:?}")]
    TimedOut(Duration),

    /// The service rejected the supplied credentials.
    #[error("authentication against '{endpoint}' failed: {reason}")]
    AuthenticationFailed { endpoint: String, reason: String },

    /// The service authenticated the request but refused to issue a certificate.
    #[error("the service declined to sign the certificate: {reason}")]
    SigningDenied { reason: String },

    /// Credentials could not be obtained for an endpoint (for example, the prompt was aborted).
    #[error("failed to obtain credentials for '{endpoint}': {reason}")]
    Credentials { endpoint: String, reason: String },

    /// The configured service URL can't be used.
    #[error("invalid service URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The service responded with something this client does not understand.
    ///
    /// This is either a bug or a version mismatch between the client and the service.
    #[error("unexpected response from the service: {0}")]
    Protocol(String),
}

/// Errors from discovering the service's authentication endpoints.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The discovery request did not complete.
    #[error("authenticator discovery is unavailable: {0}")]
    Unavailable(#[source] TransportError),

    /// The service advertised no authentication endpoints at all.
    #[error("the service does not advertise any authentication endpoints")]
    Empty,
}

/// An explicitly requested endpoint does not exist.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EndpointSelectionError {
    #[error("no authentication endpoint named '{name}' (available: {})", .available.join(", "))]
    NoSuchEndpoint { name: String, available: Vec<String> },
}

/// Errors persisting keys or certificates to the filesystem.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Writing to files was requested, but there's no identity path to derive file names from.
    #[error("no destination path was configured for the key and certificate files")]
    NoDestination,

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode key or certificate: {0}")]
    Encoding(#[from] ssh_key::Error),
}

/// Errors talking to the ssh-agent.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    /// No agent is reachable, either because `$SSH_AUTH_SOCK` is unset or because nothing is
    /// listening on the socket.
    #[error("no ssh-agent is reachable: {0}")]
    Unavailable(String),

    /// The connection to the agent failed part way through a request.
    #[error("an I/O error occurred talking to the ssh-agent: {0}")]
    Io(#[from] std::io::Error),

    /// The agent replied with a failure.
    #[error("the ssh-agent refused the request")]
    Refused,

    /// The agent replied with a message this client does not understand.
    #[error("unexpected reply from the ssh-agent: message type {0}")]
    UnexpectedReply(u8),

    /// This key algorithm cannot be added to the agent by this client.
    #[error("keys of type {0} cannot be added to the ssh-agent")]
    UnsupportedKey(String),

    #[error("failed to encode the key for the ssh-agent: {0}")]
    Encoding(#[from] ssh_key::Error),
}

/// Errors delivering a login result to its destinations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// Writing files failed. No agent registration was attempted.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The agent registration failed. Any destinations that succeeded before the agent was
    /// attempted are listed in `report`; they are not rolled back.
    #[error("{source} (completed: {report})")]
    Agent {
        #[source]
        source: AgentError,
        report: DeliveryReport,
    },
}

impl DeliveryError {
    /// The destinations that were successfully written before the failure.
    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            DeliveryError::Agent { report, .. } => Some(report),
            DeliveryError::Storage(_) => None,
        }
    }
}

/// The broad category of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    EndpointSelection,
    Key,
    Pattern,
    Authentication,
    Signing,
    Transport,
    Storage,
    Agent,
    Fatal,
}

/// Errors the [`crate::client::Client`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// A named endpoint was not advertised by the service. This is returned before any key
    /// material is loaded or generated.
    #[error(transparent)]
    EndpointSelection(#[from] EndpointSelectionError),

    #[error(transparent)]
    Key(#[from] KeyError),

    /// An include or exclude pattern is invalid. This is detected before any network traffic.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// The include and exclude patterns removed every candidate principal, so there is nothing to
    /// request a certificate for.
    #[error("no principals remain after filtering (candidates: {})", .candidates.join(", "))]
    NoPrincipals { candidates: Vec<String> },

    /// The credentials were rejected. The client never retries; if the prompt is interactive,
    /// run the login again.
    #[error(transparent)]
    Authentication(TransportError),

    /// The service refused to issue the certificate.
    #[error(transparent)]
    Signing(TransportError),

    /// Communication with the service failed. Retrying the operation is safe.
    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Delivery to files or the agent failed after a successful login.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Generic error that indicates a fatal error, likely due to a bug in the client.
    ///
    /// Retrying the operation will not help, and this should be reported as bug.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<TransportError> for ClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::AuthenticationFailed { .. } | TransportError::Credentials { .. } => {
                ClientError::Authentication(error)
            }
            TransportError::SigningDenied { .. } => ClientError::Signing(error),
            other => ClientError::Transport(other),
        }
    }
}

impl ClientError {
    /// The category of the error, for callers that want to branch on it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Discovery(_) => ErrorKind::Discovery,
            ClientError::EndpointSelection(_) => ErrorKind::EndpointSelection,
            ClientError::Key(_) => ErrorKind::Key,
            ClientError::Pattern(_) | ClientError::NoPrincipals { .. } => ErrorKind::Pattern,
            ClientError::Authentication(_) => ErrorKind::Authentication,
            ClientError::Signing(_) => ErrorKind::Signing,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Storage(_) | ClientError::Delivery(DeliveryError::Storage(_)) => {
                ErrorKind::Storage
            }
            ClientError::Agent(_) | ClientError::Delivery(DeliveryError::Agent { .. }) => {
                ErrorKind::Agent
            }
            ClientError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}
