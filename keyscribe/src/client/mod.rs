// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The keyscribe client.
//!
//! A [`Client`] is bound to a single identity and drives the login state machine for it: check
//! the cache, discover endpoints, obtain a key, authenticate, request a certificate, and cache it.
use std::{
    fmt::Display,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use ssh_key::Certificate;
use tracing::instrument;

use crate::{
    agent::AgentStore,
    cache::{CachedCertificate, CertificateCache},
    config::Identity,
    discovery::{AuthEndpoint, Discovery, EndpointSelection},
    error::{AgentError, ClientError, StorageError, TransportError},
    key::{KeyPair, KeySource},
    principals::PrincipalFilter,
    sink::{DeliveryReport, OutputSink},
    transport::{with_timeout, CredentialSource, DiscoveryTransport, Session, SigningTransport},
};

/// Configuration for the keyscribe client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The base URL of the certificate-issuing service.
    pub server_url: String,
    /// The OpenSSH private key to request a certificate for.
    ///
    /// When `generate_keypair` is set, a new key is generated instead and, if `write_cert` is
    /// also set, written to this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// The passphrase for an encrypted `identity_file`.
    ///
    /// This is never written out when the configuration is displayed.
    #[serde(skip_serializing)]
    pub identity_passphrase: Option<String>,
    /// The certificate lifetime to request, such as "10m" or "1h 30m". If unset, the service
    /// decides.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub cert_lifetime: Option<Duration>,
    /// Write the key, public key, and certificate next to `identity_file`.
    pub write_cert: bool,
    /// Request a new certificate even when the cached one is still valid.
    pub always_renew: bool,
    /// Add the key and certificate to the ssh-agent named by `$SSH_AUTH_SOCK`.
    pub use_agent: bool,
    /// Generate a new Ed25519 key for every certificate rather than loading `identity_file`.
    pub generate_keypair: bool,
    /// The authentication endpoints to log in with; an empty list uses whatever the service
    /// offers.
    pub login_endpoints: EndpointSelection,
    /// The principals to request. If empty, every principal the service says the user may have
    /// is requested.
    pub principals: Vec<String>,
    /// Only request principals matching this glob pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_principals: Option<String>,
    /// Never request principals matching this glob pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_principals: Option<String>,
    /// Treat certificates as expired this long before they actually expire.
    #[serde(with = "humantime_serde")]
    pub renewal_margin: Duration,
    /// The amount of time to wait for any single request to the service.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// The username to offer when an endpoint asks for a username and password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// A PEM-encoded certificate authority to trust for the service's TLS certificate, in
    /// addition to the system's trust store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://ssh-ca.example.com".to_string(),
            identity_file: None,
            identity_passphrase: None,
            cert_lifetime: None,
            write_cert: false,
            always_renew: false,
            use_agent: true,
            generate_keypair: false,
            login_endpoints: EndpointSelection::All,
            principals: vec![],
            include_principals: None,
            exclude_principals: None,
            renewal_margin: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
            username: None,
            ca_certificate: None,
        }
    }
}

#[cfg(feature = "cli")]
impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// A certificate along with the key it was issued for.
#[derive(Debug, Clone)]
pub struct LoginResult {
    /// The identity the certificate was issued for.
    pub identity: String,
    pub key: KeyPair,
    pub certificate: Certificate,
    pub expiry: SystemTime,
    /// The endpoints that authenticated the request, in order. This is empty if the certificate
    /// was loaded from a file written by an earlier run.
    pub endpoints: Vec<String>,
    /// Whether the certificate came from the cache rather than the service.
    pub from_cache: bool,
}

impl LoginResult {
    pub fn new(
        identity: impl Into<String>,
        key: KeyPair,
        certificate: Certificate,
        endpoints: Vec<String>,
        from_cache: bool,
    ) -> Self {
        let expiry = crate::cache::certificate_expiry(&certificate);
        Self {
            identity: identity.into(),
            key,
            certificate,
            expiry,
            endpoints,
            from_cache,
        }
    }

    fn from_cached(cached: CachedCertificate) -> Self {
        Self {
            identity: cached.identity,
            key: cached.key,
            certificate: cached.certificate,
            expiry: cached.expiry,
            endpoints: cached.endpoints,
            from_cache: true,
        }
    }

    /// The principals the certificate is valid for.
    pub fn principals(&self) -> &[String] {
        self.certificate.valid_principals()
    }

    /// How much longer the certificate is valid for, as of `now`.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expiry.duration_since(now).unwrap_or_default()
    }
}

/// The stages of a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    Resolving,
    CacheHit,
    Authenticating,
    Signing,
    Storing,
    Done,
    Failed,
}

impl Display for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            LoginState::Idle => "idle",
            LoginState::Resolving => "resolving",
            LoginState::CacheHit => "cache-hit",
            LoginState::Authenticating => "authenticating",
            LoginState::Signing => "signing",
            LoginState::Storing => "storing",
            LoginState::Done => "done",
            LoginState::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

impl LoginState {
    fn advance(&mut self, next: LoginState) {
        tracing::debug!(from = %self, to = %next, "Login state changed");
        *self = next;
    }
}

/// A keyscribe client for a single identity.
///
/// Cloning a client is cheap, and clones share the certificate cache.
#[derive(Clone, Debug)]
pub struct Client {
    config: Arc<Config>,
    identity: Arc<Identity>,
    key_source: KeySource,
    discovery: Discovery,
    signer: Arc<dyn SigningTransport>,
    credentials: Arc<dyn CredentialSource>,
    cache: Arc<CertificateCache>,
    sink: OutputSink,
}

impl Client {
    /// Create a new client.
    ///
    /// `agent` is the ssh-agent to deliver to when `use_agent` is configured; pass `None` if no
    /// agent is reachable.
    pub fn new(
        config: Config,
        discovery: Arc<dyn DiscoveryTransport>,
        signer: Arc<dyn SigningTransport>,
        credentials: Arc<dyn CredentialSource>,
        agent: Option<Arc<dyn AgentStore>>,
    ) -> Self {
        let identity = Identity::from_config(&config);
        let cache = CertificateCache::new(config.renewal_margin);
        Self {
            key_source: KeySource::new(config.identity_passphrase.clone()),
            discovery: Discovery::new(discovery, config.request_timeout),
            identity: Arc::new(identity),
            config: Arc::new(config),
            signer,
            credentials,
            cache: Arc::new(cache),
            sink: OutputSink::new(agent),
        }
    }

    /// Share `cache` with this client, so several clients (for example, one per identity) use
    /// the same certificates and locks.
    pub fn with_cache(mut self, cache: Arc<CertificateCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Get the current client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// Obtain a valid certificate for the identity.
    ///
    /// A cached certificate is returned without contacting the service unless it's within the
    /// renewal margin of expiring, its key is gone, or `always_renew` is set. Otherwise a fresh
    /// certificate is requested and cached. Nothing is cached if any step fails.
    ///
    /// The certificate is not delivered anywhere; see [`Client::login_and_deliver`].
    #[instrument(skip(self), fields(identity = %self.identity.name), err)]
    pub async fn login(&self) -> Result<LoginResult, ClientError> {
        let _guard = self.cache.lock(&self.identity.name).await;
        self.login_locked().await
    }

    /// Obtain a valid certificate and deliver it to the configured files and/or agent.
    ///
    /// If the agent is unavailable after files were written, [`ClientError::Delivery`] is
    /// returned and the certificate remains cached.
    #[instrument(skip(self), fields(identity = %self.identity.name), err)]
    pub async fn login_and_deliver(&self) -> Result<(LoginResult, DeliveryReport), ClientError> {
        let _guard = self.cache.lock(&self.identity.name).await;
        let result = self.login_locked().await?;
        let report = self
            .sink
            .deliver(
                &result,
                self.identity.write_cert,
                self.identity.use_agent,
                self.identity.key_path.as_deref(),
            )
            .await?;
        tracing::info!(%report, "Delivered certificate");
        Ok((result, report))
    }

    /// Forget the identity's certificate.
    ///
    /// The cache entry is cleared, the identity is removed from the agent, and the certificate
    /// file is deleted (along with the key files, if the key was generated by keyscribe). Logging
    /// out an identity with nothing to remove is not an error, and neither is an unreachable agent.
    ///
    /// Every step is attempted even if an earlier one fails; the first failure is returned.
    #[instrument(skip(self), fields(identity = %self.identity.name), err)]
    pub async fn logout(&self) -> Result<(), ClientError> {
        let _guard = self.cache.lock(&self.identity.name).await;
        self.cache.clear(&self.identity.name).await;

        let agent_result = self.remove_from_agent().await;
        let files_result = self.remove_files();
        if let (Err(_), Err(error)) = (&agent_result, &files_result) {
            tracing::warn!(%error, "Failed to remove certificate files");
        }
        agent_result?;
        files_result?;

        Ok(())
    }

    async fn remove_from_agent(&self) -> Result<(), AgentError> {
        if !self.identity.use_agent {
            return Ok(());
        }
        let Some(agent) = self.sink.agent() else {
            tracing::debug!("No ssh-agent configured; skipping it");
            return Ok(());
        };
        match agent.remove_identity(&self.identity.name).await {
            Ok(removed) => {
                tracing::info!(removed, "Removed identity from the ssh-agent");
                Ok(())
            }
            Err(AgentError::Unavailable(reason)) => {
                tracing::warn!(%reason, "ssh-agent is unreachable; skipping it");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn remove_files(&self) -> Result<(), StorageError> {
        if !self.identity.write_cert {
            return Ok(());
        }
        if let Some(key_path) = &self.identity.key_path {
            let removed = self.sink.remove(key_path, self.identity.generate)?;
            for path in removed {
                tracing::info!(path = %path.display(), "Removed file");
            }
        }
        Ok(())
    }

    /// List the authentication endpoints the service offers.
    #[instrument(skip(self), err)]
    pub async fn get_authenticators(&self) -> Result<Vec<AuthEndpoint>, ClientError> {
        Ok(self.discovery.discover().await?)
    }

    // The identity lock must be held.
    async fn login_locked(&self) -> Result<LoginResult, ClientError> {
        let mut state = LoginState::Idle;
        let result = self.run_login(&mut state).await;
        match &result {
            Ok(result) => tracing::info!(
                from_cache = result.from_cache,
                serial = result.certificate.serial(),
                remaining = %humantime::format_duration(Duration::from_secs(
                    result.remaining(SystemTime::now()).as_secs()
                )),
                "Certificate ready"
            ),
            Err(error) => {
                tracing::warn!(%state, %error, "Login failed");
                state.advance(LoginState::Failed);
            }
        }
        result
    }

    async fn run_login(&self, state: &mut LoginState) -> Result<LoginResult, ClientError> {
        let identity = &self.identity;
        let filter = PrincipalFilter::new(
            self.config.include_principals.as_deref(),
            self.config.exclude_principals.as_deref(),
        )?;

        state.advance(LoginState::Resolving);
        let cached = self.cached().await;
        if !self
            .cache
            .needs_renewal(cached.as_ref(), SystemTime::now(), self.config.always_renew)
        {
            if let Some(cached) = cached {
                state.advance(LoginState::CacheHit);
                tracing::debug!("Using cached certificate");
                state.advance(LoginState::Done);
                return Ok(LoginResult::from_cached(cached));
            }
        }

        let endpoints = self.discovery.discover().await?;
        let endpoints = self
            .config
            .login_endpoints
            .select(&endpoints, self.signer.supports_aggregation())?;

        let key = self
            .key_source
            .obtain(identity.key_path.as_deref(), identity.generate)?;

        state.advance(LoginState::Authenticating);
        let session = self.authenticate(&endpoints).await?;

        state.advance(LoginState::Signing);
        let candidates = if self.config.principals.is_empty() {
            session.principals.clone()
        } else {
            self.config.principals.clone()
        };
        let principals = filter.apply(&candidates);
        if principals.is_empty() {
            return Err(ClientError::NoPrincipals { candidates });
        }
        tracing::info!(?principals, "Requesting certificate");
        let certificate = with_timeout(
            self.config.request_timeout,
            self.signer.request_certificate(
                &session,
                key.public_key(),
                &principals,
                identity.lifetime,
            ),
        )
        .await?;
        if certificate.public_key() != key.public_key().key_data() {
            return Err(TransportError::Protocol(
                "the certificate was issued for a different public key".to_string(),
            )
            .into());
        }

        state.advance(LoginState::Storing);
        let endpoint_names = endpoints
            .into_iter()
            .map(|endpoint| endpoint.name)
            .collect::<Vec<_>>();
        // Generated keys only exist in memory until they're delivered.
        let key_path = if key.is_generated() {
            None
        } else {
            identity.key_path.clone()
        };
        let cached = CachedCertificate::new(
            identity.name.clone(),
            certificate.clone(),
            key.clone(),
            key_path,
            endpoint_names.clone(),
        );
        self.cache.store(&identity.name, cached).await;
        state.advance(LoginState::Done);

        Ok(LoginResult::new(
            identity.name.clone(),
            key,
            certificate,
            endpoint_names,
            false,
        ))
    }

    // Authenticate against each endpoint in turn, handing every session to the next endpoint.
    async fn authenticate(&self, endpoints: &[AuthEndpoint]) -> Result<Session, ClientError> {
        let mut session: Option<Session> = None;
        for endpoint in endpoints {
            tracing::info!(%endpoint, "Authenticating");
            let credentials = self.credentials.credentials(endpoint).await?;
            let next = with_timeout(
                self.config.request_timeout,
                self.signer
                    .authenticate(endpoint, credentials, session.as_ref()),
            )
            .await?;
            session = Some(next);
        }

        session.ok_or_else(|| anyhow::anyhow!("no authentication endpoints were selected").into())
    }

    // The in-memory entry, or one reconstructed from files written by an earlier run. An entry
    // loaded from a different key file than this identity's is a miss.
    async fn cached(&self) -> Option<CachedCertificate> {
        if let Some(cached) = self.cache.lookup(&self.identity.name).await {
            match &cached.key_path {
                Some(key_path) if Some(key_path) != self.identity.key_path.as_ref() => {
                    tracing::debug!(
                        cached = %key_path.display(),
                        "Cached certificate belongs to a different key file"
                    );
                }
                _ => return Some(cached),
            }
        }
        if !self.identity.write_cert {
            return None;
        }
        let key_path = self.identity.key_path.as_deref()?;
        let cached = self
            .cache
            .load_persisted(&self.identity.name, key_path, &self.key_source)?;
        self.cache.store(&self.identity.name, cached.clone()).await;
        Some(cached)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use ssh_key::PublicKey;

    use super::*;
    use crate::{
        config::identity_name,
        discovery::CredentialType,
        error::{ErrorKind, KeyError},
        sink,
        testing,
        transport::{CredentialMaterial, StaticCredentials},
    };

    #[derive(Debug)]
    struct FakeService {
        endpoints: Vec<AuthEndpoint>,
        principals: Vec<String>,
        aggregate: bool,
        valid_for: Duration,
        discoveries: AtomicUsize,
        authentications: AtomicUsize,
        signatures: AtomicUsize,
        previous_sessions: Mutex<Vec<Option<String>>>,
        requested: Mutex<Vec<Vec<String>>>,
        stall: Option<Stall>,
    }

    // A request the service never answers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stall {
        Authenticate,
        Sign,
    }

    impl Default for FakeService {
        fn default() -> Self {
            Self {
                endpoints: vec![endpoint("corp"), endpoint("github")],
                principals: vec!["web-1".into(), "web-2".into(), "db-1".into()],
                aggregate: false,
                valid_for: Duration::from_secs(600),
                discoveries: AtomicUsize::new(0),
                authentications: AtomicUsize::new(0),
                signatures: AtomicUsize::new(0),
                previous_sessions: Mutex::new(vec![]),
                requested: Mutex::new(vec![]),
                stall: None,
            }
        }
    }

    impl FakeService {
        fn network_calls(&self) -> usize {
            self.discoveries.load(Ordering::SeqCst)
                + self.authentications.load(Ordering::SeqCst)
                + self.signatures.load(Ordering::SeqCst)
        }

        async fn maybe_stall(&self, at: Stall) {
            if self.stall == Some(at) {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
            }
        }
    }

    #[async_trait]
    impl DiscoveryTransport for FakeService {
        async fn list_endpoints(&self) -> Result<Vec<AuthEndpoint>, TransportError> {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            Ok(self.endpoints.clone())
        }
    }

    #[async_trait]
    impl SigningTransport for FakeService {
        fn supports_aggregation(&self) -> bool {
            self.aggregate
        }

        async fn authenticate(
            &self,
            endpoint: &AuthEndpoint,
            credentials: CredentialMaterial,
            previous: Option<&Session>,
        ) -> Result<Session, TransportError> {
            self.authentications.fetch_add(1, Ordering::SeqCst);
            self.maybe_stall(Stall::Authenticate).await;
            self.previous_sessions
                .lock()
                .unwrap()
                .push(previous.map(|s| s.token().to_string()));
            if credentials == CredentialMaterial::Token("wrong".into()) {
                return Err(TransportError::AuthenticationFailed {
                    endpoint: endpoint.name.clone(),
                    reason: "bad token".into(),
                });
            }
            let mut endpoints = previous.map(|s| s.endpoints.clone()).unwrap_or_default();
            endpoints.push(endpoint.name.clone());
            Ok(Session::new(
                format!("token-{}", endpoint.name),
                self.principals.clone(),
                endpoints,
            ))
        }

        async fn request_certificate(
            &self,
            _session: &Session,
            public_key: &PublicKey,
            principals: &[String],
            lifetime: Option<Duration>,
        ) -> Result<Certificate, TransportError> {
            self.signatures.fetch_add(1, Ordering::SeqCst);
            self.maybe_stall(Stall::Sign).await;
            self.requested.lock().unwrap().push(principals.to_vec());
            let principals = principals.iter().map(String::as_str).collect::<Vec<_>>();
            let valid_for = lifetime.unwrap_or(self.valid_for);
            testing::issue(public_key, &principals, SystemTime::now() + valid_for)
                .map_err(|error| TransportError::Protocol(error.to_string()))
        }
    }

    fn endpoint(name: &str) -> AuthEndpoint {
        AuthEndpoint {
            name: name.to_string(),
            realm: name.to_uppercase(),
            credential_type: CredentialType::UserPassword,
            login_handle: None,
        }
    }

    fn client(config: Config, service: &Arc<FakeService>) -> Client {
        client_with_credentials(config, service, CredentialMaterial::Token("good".into()))
    }

    fn client_with_credentials(
        config: Config,
        service: &Arc<FakeService>,
        credentials: CredentialMaterial,
    ) -> Client {
        Client::new(
            config,
            service.clone(),
            service.clone(),
            Arc::new(StaticCredentials(credentials)),
            None,
        )
    }

    fn adhoc() -> Config {
        Config {
            generate_keypair: true,
            use_agent: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_login_goes_to_the_service() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                include_principals: Some("web-*".into()),
                ..adhoc()
            },
            &service,
        );

        let result = client.login().await?;
        assert!(!result.from_cache);
        assert_eq!(["web-1", "web-2"], result.principals());
        assert_eq!(vec!["corp".to_string()], result.endpoints);
        assert_eq!(1, service.discoveries.load(Ordering::SeqCst));
        assert_eq!(1, service.authentications.load(Ordering::SeqCst));
        assert_eq!(1, service.signatures.load(Ordering::SeqCst));

        let cached = client.cache().lookup("adhoc").await.expect("result is cached");
        assert_eq!(result.certificate, cached.certificate);
        assert_eq!(result.expiry, cached.expiry);

        Ok(())
    }

    #[tokio::test]
    async fn cached_login_makes_no_network_calls() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(adhoc(), &service);

        let first = client.login().await?;
        let calls = service.network_calls();
        let second = client.login().await?;
        assert!(second.from_cache);
        assert_eq!(first.certificate, second.certificate);
        assert_eq!(first.key, second.key);
        assert_eq!(calls, service.network_calls());

        Ok(())
    }

    #[tokio::test]
    async fn always_renew_ignores_the_cache() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                always_renew: true,
                ..adhoc()
            },
            &service,
        );

        let first = client.login().await?;
        let second = client.login().await?;
        assert!(!second.from_cache);
        assert_ne!(first.certificate.serial(), second.certificate.serial());
        assert_eq!(2, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn margin_forces_renewal() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                renewal_margin: Duration::from_secs(3600),
                ..adhoc()
            },
            &service,
        );

        client.login().await?;
        let second = client.login().await?;
        assert!(!second.from_cache);
        assert_eq!(2, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn explicit_principals_are_filtered() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                principals: vec!["alice".into(), "root".into(), "web-9".into()],
                exclude_principals: Some("root".into()),
                ..adhoc()
            },
            &service,
        );

        let result = client.login().await?;
        assert_eq!(["alice", "web-9"], result.principals());
        assert_eq!(
            vec![vec!["alice".to_string(), "web-9".to_string()]],
            *service.requested.lock().unwrap()
        );

        Ok(())
    }

    #[tokio::test]
    async fn nothing_left_to_request() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                include_principals: Some("admin-*".into()),
                ..adhoc()
            },
            &service,
        );

        let error = client.login().await.unwrap_err();
        assert!(matches!(error, ClientError::NoPrincipals { .. }));
        assert_eq!(0, service.signatures.load(Ordering::SeqCst));
        assert!(client.cache().lookup("adhoc").await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn invalid_pattern_fails_before_the_network() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                include_principals: Some("web-[".into()),
                ..adhoc()
            },
            &service,
        );

        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::Pattern, error.kind());
        assert_eq!(0, service.network_calls());

        Ok(())
    }

    // An unknown endpoint is reported even though the identity file doesn't exist, since
    // endpoints are resolved before any key is loaded.
    #[tokio::test]
    async fn unknown_endpoint_before_key_material() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                identity_file: Some(PathBuf::from("/does/not/exist/id_ed25519")),
                login_endpoints: EndpointSelection::Named(vec!["prod-realm".into()]),
                use_agent: false,
                ..Default::default()
            },
            &service,
        );

        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::EndpointSelection, error.kind());
        assert_eq!(0, service.authentications.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn missing_identity_file() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                identity_file: Some(PathBuf::from("/does/not/exist/id_ed25519")),
                use_agent: false,
                ..Default::default()
            },
            &service,
        );

        let error = client.login().await.unwrap_err();
        assert!(matches!(error, ClientError::Key(KeyError::NotFound { .. })));
        assert_eq!(0, service.authentications.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn sessions_are_aggregated() -> Result<()> {
        let service = Arc::new(FakeService {
            aggregate: true,
            ..Default::default()
        });
        let client = client(adhoc(), &service);

        let result = client.login().await?;
        assert_eq!(vec!["corp".to_string(), "github".to_string()], result.endpoints);
        assert_eq!(
            vec![None, Some("token-corp".to_string())],
            *service.previous_sessions.lock().unwrap()
        );

        Ok(())
    }

    #[tokio::test]
    async fn named_endpoints_keep_their_order() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                login_endpoints: EndpointSelection::Named(vec!["github".into(), "corp".into()]),
                ..adhoc()
            },
            &service,
        );

        let result = client.login().await?;
        assert_eq!(vec!["github".to_string(), "corp".to_string()], result.endpoints);

        Ok(())
    }

    #[tokio::test]
    async fn rejected_credentials() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client_with_credentials(
            adhoc(),
            &service,
            CredentialMaterial::Token("wrong".into()),
        );

        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::Authentication, error.kind());
        // No retries
        assert_eq!(1, service.authentications.load(Ordering::SeqCst));
        assert_eq!(0, service.signatures.load(Ordering::SeqCst));
        assert!(client.cache().lookup("adhoc").await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn get_authenticators() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(adhoc(), &service);

        let endpoints = client.get_authenticators().await?;
        assert_eq!(vec![endpoint("corp"), endpoint("github")], endpoints);
        assert_eq!(1, service.discoveries.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn logout_then_login() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(adhoc(), &service);

        let first = client.login().await?;
        client.logout().await?;
        assert!(client.cache().lookup("adhoc").await.is_none());
        // Logging out twice is fine
        client.logout().await?;

        let second = client.login().await?;
        assert!(!second.from_cache);
        assert_ne!(first.certificate.serial(), second.certificate.serial());

        Ok(())
    }

    #[tokio::test]
    async fn deliver_and_reload_from_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("id_ed25519");
        let service = Arc::new(FakeService::default());
        let config = Config {
            identity_file: Some(key_path.clone()),
            write_cert: true,
            ..adhoc()
        };

        let (result, report) = client(config.clone(), &service).login_and_deliver().await?;
        assert_eq!(3, report.delivered.len());
        assert!(sink::certificate_path(&key_path).exists());
        assert_eq!(identity_name(&key_path), result.identity);

        // A new client (a new process, in practice) picks the certificate up from disk.
        let calls = service.network_calls();
        let reloaded = client(config.clone(), &service).login().await?;
        assert!(reloaded.from_cache);
        assert_eq!(result.certificate, reloaded.certificate);
        assert_eq!(result.key, reloaded.key);
        assert_eq!(calls, service.network_calls());

        // Logging out removes the generated key along with the certificate.
        client(config, &service).logout().await?;
        assert!(!key_path.exists());
        assert!(!sink::certificate_path(&key_path).exists());
        assert!(!sink::public_key_path(&key_path).exists());

        Ok(())
    }

    #[tokio::test]
    async fn shared_cache_serializes_logins() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let cache = Arc::new(CertificateCache::default());
        let first = client(adhoc(), &service).with_cache(cache.clone());
        let second = client(adhoc(), &service).with_cache(cache);

        let (a, b) = tokio::join!(first.login(), second.login());
        let (a, b) = (a?, b?);
        // One of them waited for the other and found its certificate.
        assert_eq!(a.certificate, b.certificate);
        assert!(a.from_cache ^ b.from_cache);
        assert_eq!(1, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn agent_requested_without_agent() -> Result<()> {
        let service = Arc::new(FakeService::default());
        let client = client(
            Config {
                use_agent: true,
                ..adhoc()
            },
            &service,
        );

        let error = client.login_and_deliver().await.unwrap_err();
        assert_eq!(ErrorKind::Agent, error.kind());
        // The login itself succeeded
        assert!(client.cache().lookup("adhoc").await.is_some());
        // Logging out without an agent is fine
        client.logout().await?;

        Ok(())
    }

    // Write a fresh key to `dir/id_ed25519`.
    fn identity_file(dir: &Path) -> Result<(PathBuf, KeyPair)> {
        let key_path = dir.join("id_ed25519");
        let key = KeySource::default().obtain(None, true)?;
        std::fs::write(&key_path, key.private_key_openssh()?)?;
        Ok((key_path, key))
    }

    fn with_identity_file(key_path: &Path) -> Config {
        Config {
            identity_file: Some(key_path.to_path_buf()),
            use_agent: false,
            ..Default::default()
        }
    }

    // Two identity files with the same file name are separate identities, even when their
    // clients share a cache.
    #[tokio::test]
    async fn same_file_name_shared_cache() -> Result<()> {
        let (dir_a, dir_b) = (tempfile::tempdir()?, tempfile::tempdir()?);
        let (path_a, key_a) = identity_file(dir_a.path())?;
        let (path_b, key_b) = identity_file(dir_b.path())?;
        let service = Arc::new(FakeService::default());
        let cache = Arc::new(CertificateCache::default());
        let client_a = client(with_identity_file(&path_a), &service).with_cache(cache.clone());
        let client_b = client(with_identity_file(&path_b), &service).with_cache(cache.clone());
        assert_ne!(client_a.identity().name, client_b.identity().name);

        let a = client_a.login().await?;
        let b = client_b.login().await?;
        assert_eq!(key_a, a.key);
        assert_eq!(key_b, b.key);
        assert!(!b.from_cache);
        assert_ne!(a.certificate, b.certificate);
        assert_eq!(2, service.signatures.load(Ordering::SeqCst));

        // Each identity's fast path returns its own certificate.
        assert_eq!(a.certificate, client_a.login().await?.certificate);
        assert_eq!(b.certificate, client_b.login().await?.certificate);
        assert_eq!(2, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    // A cache entry whose key came from another file isn't handed out for this identity.
    #[tokio::test]
    async fn entry_for_another_key_file_is_a_miss() -> Result<()> {
        let (dir_a, dir_b) = (tempfile::tempdir()?, tempfile::tempdir()?);
        let (path_a, key_a) = identity_file(dir_a.path())?;
        let (path_b, key_b) = identity_file(dir_b.path())?;
        let service = Arc::new(FakeService::default());
        let client_b = client(with_identity_file(&path_b), &service);

        let certificate = testing::issue(
            key_a.public_key(),
            &["web-1"],
            SystemTime::now() + Duration::from_secs(600),
        )?;
        let foreign = CachedCertificate::new(
            client_b.identity().name.clone(),
            certificate.clone(),
            key_a,
            Some(path_a),
            vec![],
        );
        client_b
            .cache()
            .store(&client_b.identity().name, foreign)
            .await;

        let result = client_b.login().await?;
        assert!(!result.from_cache);
        assert_eq!(key_b, result.key);
        assert_ne!(certificate, result.certificate);
        assert_eq!(1, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hung_authentication_times_out() -> Result<()> {
        let service = Arc::new(FakeService {
            stall: Some(Stall::Authenticate),
            ..Default::default()
        });
        let client = client(
            Config {
                request_timeout: Duration::from_secs(30),
                ..adhoc()
            },
            &service,
        );

        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::Transport, error.kind());
        assert!(matches!(
            error,
            ClientError::Transport(TransportError::TimedOut(timeout))
                if timeout == Duration::from_secs(30)
        ));
        assert_eq!(0, service.signatures.load(Ordering::SeqCst));
        assert!(client.cache().lookup("adhoc").await.is_none());

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hung_signing_times_out() -> Result<()> {
        let service = Arc::new(FakeService {
            stall: Some(Stall::Sign),
            ..Default::default()
        });
        let client = client(adhoc(), &service);

        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::Transport, error.kind());
        assert!(matches!(
            error,
            ClientError::Transport(TransportError::TimedOut(_))
        ));
        assert_eq!(1, service.signatures.load(Ordering::SeqCst));
        assert!(client.cache().lookup("adhoc").await.is_none());

        // The next attempt starts over rather than picking up the abandoned request.
        let error = client.login().await.unwrap_err();
        assert_eq!(ErrorKind::Transport, error.kind());
        assert_eq!(2, service.signatures.load(Ordering::SeqCst));

        Ok(())
    }

    // An agent that refuses every request.
    #[derive(Debug, Default)]
    struct RefusingAgent {
        removals: AtomicUsize,
    }

    #[async_trait]
    impl AgentStore for RefusingAgent {
        async fn add_identity(
            &self,
            _identity: &str,
            _key: &KeyPair,
            _certificate: &Certificate,
            _lifetime: Option<Duration>,
        ) -> Result<(), AgentError> {
            Err(AgentError::Refused)
        }

        async fn remove_identity(&self, _identity: &str) -> Result<usize, AgentError> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Refused)
        }
    }

    // A refusing agent doesn't stop logout from deleting the certificate files.
    #[tokio::test]
    async fn logout_removes_files_when_agent_refuses() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("id_ed25519");
        let service = Arc::new(FakeService::default());
        let agent = Arc::new(RefusingAgent::default());
        let config = Config {
            identity_file: Some(key_path.clone()),
            write_cert: true,
            ..adhoc()
        };
        client(config.clone(), &service).login_and_deliver().await?;
        assert!(sink::certificate_path(&key_path).exists());

        let client = Client::new(
            Config {
                use_agent: true,
                ..config
            },
            service.clone(),
            service.clone(),
            Arc::new(StaticCredentials(CredentialMaterial::Token("good".into()))),
            Some(agent.clone() as Arc<dyn AgentStore>),
        );
        let error = client.logout().await.unwrap_err();
        assert!(matches!(error, ClientError::Agent(AgentError::Refused)));
        assert_eq!(1, agent.removals.load(Ordering::SeqCst));
        assert!(!sink::certificate_path(&key_path).exists());
        assert!(!key_path.exists());
        assert!(!sink::public_key_path(&key_path).exists());
        assert!(client.cache().lookup(&client.identity().name).await.is_none());

        Ok(())
    }

    #[cfg(feature = "cli")]
    #[test]
    fn passphrase_is_not_displayed() {
        let config = Config {
            identity_passphrase: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!config.to_string().contains("hunter2"));
    }
}
