// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The interfaces the client needs from the certificate-issuing service.
//!
//! The [`crate::client::Client`] only knows about these traits. [`http::HttpTransport`] implements
//! them for the HTTP/JSON API; tests substitute in-process fakes.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use ssh_key::{Certificate, PublicKey};

use crate::{discovery::AuthEndpoint, error::TransportError};

pub mod http;

pub use http::HttpTransport;

/// Lists the authentication endpoints a service offers.
#[async_trait]
pub trait DiscoveryTransport: Debug + Send + Sync {
    /// Perform a single request for the advertised endpoints.
    async fn list_endpoints(&self) -> Result<Vec<AuthEndpoint>, TransportError>;
}

/// Authenticates users and issues certificates.
#[async_trait]
pub trait SigningTransport: Debug + Send + Sync {
    /// Whether a session from one endpoint can be extended by authenticating against another.
    ///
    /// When this is false, only a single endpoint is used per login.
    fn supports_aggregation(&self) -> bool {
        false
    }

    /// Authenticate against an endpoint.
    ///
    /// If `previous` is provided, the resulting session carries the identities proven by both
    /// sessions. This may block for as long as the user takes to complete any out-of-band step.
    async fn authenticate(
        &self,
        endpoint: &AuthEndpoint,
        credentials: CredentialMaterial,
        previous: Option<&Session>,
    ) -> Result<Session, TransportError>;

    /// Request a certificate for `public_key` valid for `principals`.
    ///
    /// If `lifetime` is `None`, the service picks the lifetime.
    async fn request_certificate(
        &self,
        session: &Session,
        public_key: &PublicKey,
        principals: &[String],
        lifetime: Option<Duration>,
    ) -> Result<Certificate, TransportError>;
}

/// Supplies the credentials for an endpoint, possibly by asking the user.
#[async_trait]
pub trait CredentialSource: Debug + Send + Sync {
    async fn credentials(
        &self,
        endpoint: &AuthEndpoint,
    ) -> Result<CredentialMaterial, TransportError>;
}

/// Credentials presented to an endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialMaterial {
    Password { username: String, password: String },
    Token(String),
    /// The endpoint needs nothing beyond the previous session (or nothing at all).
    None,
}

impl Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
            Self::None => write!(f, "None"),
        }
    }
}

/// Always hands out the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub CredentialMaterial);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(
        &self,
        _endpoint: &AuthEndpoint,
    ) -> Result<CredentialMaterial, TransportError> {
        Ok(self.0.clone())
    }
}

/// An authenticated session with the signing service.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    /// The principals the authenticated user may request.
    pub principals: Vec<String>,
    /// The names of the endpoints this session has authenticated against, in order.
    pub endpoints: Vec<String>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("principals", &self.principals)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl Session {
    pub fn new(token: impl Into<String>, principals: Vec<String>, endpoints: Vec<String>) -> Self {
        Self {
            token: token.into(),
            principals,
            endpoints,
        }
    }

    /// The opaque bearer token for the session.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Bound a transport call by `timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    request: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::warn!(?timeout, "Request to the signing service timed out");
            Err(TransportError::TimedOut(timeout))
        }
    }
}
