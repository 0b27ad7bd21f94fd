// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The HTTP/JSON protocol spoken by the certificate-issuing service.
//!
//! * `GET /v1/auth` lists the authentication endpoints.
//! * `POST /v1/auth/{name}` authenticates with HTTP basic auth or a bearer token. A session from
//!   an earlier endpoint is passed in the `X-Previous-Session` header to aggregate the two.
//! * `POST /v1/sign` requests a certificate using the session token as a bearer token.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use ssh_key::{Certificate, PublicKey};

use super::{CredentialMaterial, DiscoveryTransport, Session, SigningTransport};
use crate::{discovery::AuthEndpoint, error::TransportError};

/// The header used to hand an existing session to another endpoint.
pub const PREVIOUS_SESSION_HEADER: &str = "X-Previous-Session";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    #[serde(default)]
    principals: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    public_key: String,
    principals: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    lifetime_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Talks to the service over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

/// Configures an [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportBuilder {
    base_url: String,
    timeout: Duration,
    ca_certificate: Option<PathBuf>,
}

impl HttpTransportBuilder {
    /// The amount of time to wait for any single request; defaults to 30 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Trust the PEM-encoded certificate authority at `path` in addition to the system roots.
    pub fn ca_certificate(mut self, path: Option<PathBuf>) -> Self {
        self.ca_certificate = path;
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let base_url = Url::parse(&self.base_url).map_err(|error| TransportError::InvalidUrl {
            url: self.base_url.clone(),
            reason: error.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl {
                url: self.base_url,
                reason: "not a base URL".to_string(),
            });
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("keyscribe/", env!("CARGO_PKG_VERSION")));
        if let Some(path) = &self.ca_certificate {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            tracing::debug!(path = %path.display(), "Trusting additional certificate authority");
        }

        Ok(HttpTransport {
            http: builder.build()?,
            base_url,
        })
    }
}

impl HttpTransport {
    pub fn builder(base_url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            ca_certificate: None,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base URL".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

// The human-readable reason from an error response, falling back to the raw body.
async fn error_reason(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorResponse>(&body)
        .map(|error| error.error)
        .ok()
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        })
}

async fn json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|error| TransportError::Protocol(format!("malformed response body: {error}")))
}

#[async_trait]
impl DiscoveryTransport for HttpTransport {
    #[tracing::instrument(level = "debug", skip(self), fields(url = %self.base_url), err)]
    async fn list_endpoints(&self) -> Result<Vec<AuthEndpoint>, TransportError> {
        let response = self.http.get(self.url(&["v1", "auth"])?).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(TransportError::Protocol(format!(
                "listing authentication endpoints failed with {status}: {}",
                error_reason(response).await
            )));
        }
        json(response).await
    }
}

#[async_trait]
impl SigningTransport for HttpTransport {
    fn supports_aggregation(&self) -> bool {
        true
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, credentials, previous),
        fields(endpoint = %endpoint.name),
        err
    )]
    async fn authenticate(
        &self,
        endpoint: &AuthEndpoint,
        credentials: CredentialMaterial,
        previous: Option<&Session>,
    ) -> Result<Session, TransportError> {
        let mut request = self.http.post(self.url(&["v1", "auth", &endpoint.name])?);
        request = match credentials {
            CredentialMaterial::Password { username, password } => {
                request.basic_auth(username, Some(password))
            }
            CredentialMaterial::Token(token) => request.bearer_auth(token),
            CredentialMaterial::None => request,
        };
        if let Some(previous) = previous {
            request = request.header(PREVIOUS_SESSION_HEADER, previous.token());
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(TransportError::AuthenticationFailed {
                    endpoint: endpoint.name.clone(),
                    reason: error_reason(response).await,
                });
            }
            status => {
                return Err(TransportError::Protocol(format!(
                    "authentication against '{}' failed with {status}: {}",
                    endpoint.name,
                    error_reason(response).await
                )));
            }
        }

        let auth: AuthResponse = json(response).await?;
        let mut endpoints = previous
            .map(|session| session.endpoints.clone())
            .unwrap_or_default();
        endpoints.push(endpoint.name.clone());
        Ok(Session::new(auth.token, auth.principals, endpoints))
    }

    #[tracing::instrument(level = "debug", skip(self, session, public_key), err)]
    async fn request_certificate(
        &self,
        session: &Session,
        public_key: &PublicKey,
        principals: &[String],
        lifetime: Option<Duration>,
    ) -> Result<Certificate, TransportError> {
        let body = SignRequest {
            public_key: public_key
                .to_openssh()
                .map_err(|error| TransportError::Protocol(error.to_string()))?,
            principals,
            lifetime_secs: lifetime.map(|lifetime| lifetime.as_secs()),
        };
        let response = self
            .http
            .post(self.url(&["v1", "sign"])?)
            .bearer_auth(session.token())
            .json(&body)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED => {
                return Err(TransportError::AuthenticationFailed {
                    endpoint: session.endpoints.join(", "),
                    reason: error_reason(response).await,
                });
            }
            StatusCode::FORBIDDEN => {
                return Err(TransportError::SigningDenied {
                    reason: error_reason(response).await,
                });
            }
            status => {
                return Err(TransportError::Protocol(format!(
                    "signing request failed with {status}: {}",
                    error_reason(response).await
                )));
            }
        }

        let signed: SignResponse = json(response).await?;
        Certificate::from_openssh(signed.certificate.trim())
            .map_err(|error| TransportError::Protocol(format!("malformed certificate: {error}")))
    }
}
