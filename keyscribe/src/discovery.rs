// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Discovering the service's authentication endpoints and choosing which to log in with.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{DiscoveryError, EndpointSelectionError},
    transport::{with_timeout, DiscoveryTransport},
};

/// How an endpoint expects the user to prove their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// A username and password.
    UserPassword,
    /// A browser-based single sign-on flow.
    Federated,
    #[serde(other)]
    Other,
}

/// An authentication endpoint advertised by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEndpoint {
    /// The endpoint name; this is what `--login` refers to.
    pub name: String,
    /// A human-readable description of the realm the endpoint authenticates against.
    pub realm: String,
    pub credential_type: CredentialType,
    /// The handle the transport uses to start a login against this endpoint.
    #[serde(default)]
    pub login_handle: Option<String>,
}

impl std::fmt::Display for AuthEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.realm)
    }
}

/// Which of the discovered endpoints to authenticate against.
///
/// In configuration files this is a list of names; an empty list means [`EndpointSelection::All`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum EndpointSelection {
    /// Every endpoint if the transport can aggregate sessions, otherwise the first one.
    #[default]
    All,
    /// Exactly these endpoints, in this order.
    Named(Vec<String>),
}

impl From<Vec<String>> for EndpointSelection {
    fn from(names: Vec<String>) -> Self {
        if names.is_empty() {
            EndpointSelection::All
        } else {
            EndpointSelection::Named(names)
        }
    }
}

impl From<EndpointSelection> for Vec<String> {
    fn from(selection: EndpointSelection) -> Self {
        match selection {
            EndpointSelection::All => vec![],
            EndpointSelection::Named(names) => names,
        }
    }
}

impl EndpointSelection {
    /// Narrow `endpoints` according to the selection.
    ///
    /// `aggregate` indicates whether more than one endpoint can be used when no names are given.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointSelectionError::NoSuchEndpoint`] for the first requested name that isn't
    /// among `endpoints`.
    pub fn select(
        &self,
        endpoints: &[AuthEndpoint],
        aggregate: bool,
    ) -> Result<Vec<AuthEndpoint>, EndpointSelectionError> {
        match self {
            EndpointSelection::All if aggregate => Ok(endpoints.to_vec()),
            EndpointSelection::All => Ok(endpoints.iter().take(1).cloned().collect()),
            EndpointSelection::Named(names) => {
                let mut selected: Vec<AuthEndpoint> = Vec::with_capacity(names.len());
                for name in names {
                    if selected.iter().any(|endpoint| &endpoint.name == name) {
                        continue;
                    }
                    let endpoint = endpoints
                        .iter()
                        .find(|endpoint| &endpoint.name == name)
                        .ok_or_else(|| EndpointSelectionError::NoSuchEndpoint {
                            name: name.clone(),
                            available: endpoints.iter().map(|e| e.name.clone()).collect(),
                        })?;
                    selected.push(endpoint.clone());
                }
                Ok(selected)
            }
        }
    }
}

/// Queries the service for its authentication endpoints.
#[derive(Debug, Clone)]
pub struct Discovery {
    transport: Arc<dyn DiscoveryTransport>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(transport: Arc<dyn DiscoveryTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Fetch the full list of advertised endpoints with a single request.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Unavailable`] if the request fails or times out, and
    /// [`DiscoveryError::Empty`] if the service advertises no endpoints.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn discover(&self) -> Result<Vec<AuthEndpoint>, DiscoveryError> {
        let endpoints = with_timeout(self.timeout, self.transport.list_endpoints())
            .await
            .map_err(DiscoveryError::Unavailable)?;
        if endpoints.is_empty() {
            return Err(DiscoveryError::Empty);
        }
        tracing::debug!(
            endpoints = ?endpoints.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            "Discovered authentication endpoints"
        );
        Ok(endpoints)
    }
}
