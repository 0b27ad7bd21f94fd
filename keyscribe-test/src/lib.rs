// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing keyscribe: an in-process certificate-issuing service, an ssh-agent that
//! listens on a Unix socket, and an [`Instance`] that wires a [`Client`] to both.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use keyscribe::{
    agent::{
        put_string, read_string, AgentStore, SshAgent, SSH_AGENTC_ADD_ID_CONSTRAINED,
        SSH_AGENTC_REMOVE_IDENTITY, SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENT_CONSTRAIN_LIFETIME,
        SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SUCCESS,
    },
    client::{Client, Config},
    discovery::{AuthEndpoint, CredentialType},
    error::TransportError,
    transport::{
        CredentialMaterial, DiscoveryTransport, Session, SigningTransport, StaticCredentials,
    },
};
use rand::{rngs::OsRng, RngCore};
use ssh_key::{
    certificate::{Builder, CertType},
    Algorithm, Certificate, LineEnding, PrivateKey, PublicKey,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub mod users {
    pub const ALICE: &str = "alice";
    pub const ALICE_PASSWORD: &str = "correct horse battery staple";
    pub const ALICE_PRINCIPALS: [&str; 3] = ["web-1", "web-2", "db-1"];

    pub const BOB: &str = "bob";
    pub const BOB_PASSWORD: &str = "hunter2";
    pub const BOB_PRINCIPALS: [&str; 2] = ["bob", "build-1"];
}

/// The certificate lifetime the fake service uses when the client doesn't ask for one.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct User {
    password: String,
    principals: Vec<String>,
}

/// A certificate-issuing service that runs in-process with a real Ed25519 CA.
#[derive(Debug)]
pub struct FakeService {
    ca: PrivateKey,
    endpoints: Vec<AuthEndpoint>,
    users: HashMap<String, User>,
    aggregation: bool,
    available: AtomicBool,
    sessions: Mutex<HashMap<String, String>>,
    issued: Mutex<Vec<Certificate>>,
    discoveries: AtomicUsize,
    authentications: AtomicUsize,
    signatures: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct FakeServiceBuilder {
    endpoints: Vec<AuthEndpoint>,
    users: HashMap<String, User>,
    aggregation: bool,
}

impl FakeServiceBuilder {
    /// Advertise a username/password endpoint.
    pub fn endpoint(mut self, name: &str, realm: &str) -> Self {
        self.endpoints.push(AuthEndpoint {
            name: name.to_string(),
            realm: realm.to_string(),
            credential_type: CredentialType::UserPassword,
            login_handle: None,
        });
        self
    }

    /// Allow `username` to log in with `password` and request `principals`.
    pub fn user(mut self, username: &str, password: &str, principals: &[&str]) -> Self {
        self.users.insert(
            username.to_string(),
            User {
                password: password.to_string(),
                principals: principals.iter().map(ToString::to_string).collect(),
            },
        );
        self
    }

    pub fn with_aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn build(self) -> anyhow::Result<FakeService> {
        Ok(FakeService {
            ca: PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?,
            endpoints: self.endpoints,
            users: self.users,
            aggregation: self.aggregation,
            available: AtomicBool::new(true),
            sessions: Mutex::default(),
            issued: Mutex::default(),
            discoveries: AtomicUsize::new(0),
            authentications: AtomicUsize::new(0),
            signatures: AtomicUsize::new(0),
        })
    }
}

impl FakeService {
    pub fn builder() -> FakeServiceBuilder {
        FakeServiceBuilder::default()
    }

    /// A service with a "corp" and a "github" endpoint that knows alice and bob.
    pub fn standard() -> anyhow::Result<Self> {
        Self::builder()
            .endpoint("corp", "CORP.EXAMPLE.COM")
            .endpoint("github", "github.com")
            .user(users::ALICE, users::ALICE_PASSWORD, &users::ALICE_PRINCIPALS)
            .user(users::BOB, users::BOB_PASSWORD, &users::BOB_PRINCIPALS)
            .build()
    }

    /// The public key of the certificate authority.
    pub fn ca_public_key(&self) -> &PublicKey {
        self.ca.public_key()
    }

    /// Make every request fail as though the service were unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }

    pub fn signatures(&self) -> usize {
        self.signatures.load(Ordering::SeqCst)
    }

    /// The total number of requests the service has received.
    pub fn requests(&self) -> usize {
        self.discoveries() + self.authentications() + self.signatures()
    }

    /// Every certificate issued so far, oldest first.
    pub fn issued(&self) -> Vec<Certificate> {
        self.issued.lock().expect("lock is not poisoned").clone()
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "the service is down",
            )))
        }
    }

    fn issue(
        &self,
        public_key: &PublicKey,
        principals: &[String],
        lifetime: Duration,
    ) -> anyhow::Result<Certificate> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            public_key,
            now.saturating_sub(60),
            now + lifetime.as_secs(),
        )?;
        builder.serial(OsRng.next_u64())?;
        builder.key_id(format!("keyscribe-test-{}", principals.join(",")))?;
        builder.cert_type(CertType::User)?;
        for principal in principals {
            builder.valid_principal(principal.clone())?;
        }
        Ok(builder.sign(&self.ca)?)
    }
}

#[async_trait]
impl DiscoveryTransport for FakeService {
    async fn list_endpoints(&self) -> Result<Vec<AuthEndpoint>, TransportError> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.endpoints.clone())
    }
}

#[async_trait]
impl SigningTransport for FakeService {
    fn supports_aggregation(&self) -> bool {
        self.aggregation
    }

    async fn authenticate(
        &self,
        endpoint: &AuthEndpoint,
        credentials: CredentialMaterial,
        previous: Option<&Session>,
    ) -> Result<Session, TransportError> {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let rejected = |reason: &str| TransportError::AuthenticationFailed {
            endpoint: endpoint.name.clone(),
            reason: reason.to_string(),
        };
        let CredentialMaterial::Password { username, password } = credentials else {
            return Err(rejected("a username and password are required"));
        };
        let user = self
            .users
            .get(&username)
            .filter(|user| user.password == password)
            .ok_or_else(|| rejected("invalid username or password"))?;

        let mut token = [0u8; 16];
        OsRng.fill_bytes(&mut token);
        let token = token.iter().map(|b| format!("{b:02x}")).collect::<String>();
        self.sessions
            .lock()
            .expect("lock is not poisoned")
            .insert(token.clone(), username);

        let mut endpoints = previous
            .map(|session| session.endpoints.clone())
            .unwrap_or_default();
        endpoints.push(endpoint.name.clone());
        Ok(Session::new(token, user.principals.clone(), endpoints))
    }

    async fn request_certificate(
        &self,
        session: &Session,
        public_key: &PublicKey,
        principals: &[String],
        lifetime: Option<Duration>,
    ) -> Result<Certificate, TransportError> {
        self.signatures.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let username = self
            .sessions
            .lock()
            .expect("lock is not poisoned")
            .get(session.token())
            .cloned()
            .ok_or_else(|| TransportError::AuthenticationFailed {
                endpoint: session.endpoints.join(", "),
                reason: "unknown session".to_string(),
            })?;
        let allowed = &self.users[&username].principals;
        if let Some(principal) = principals.iter().find(|p| !allowed.contains(*p)) {
            return Err(TransportError::SigningDenied {
                reason: format!("{username} may not request '{principal}'"),
            });
        }

        let certificate = self
            .issue(public_key, principals, lifetime.unwrap_or(DEFAULT_LIFETIME))
            .map_err(|error| TransportError::Protocol(error.to_string()))?;
        self.issued
            .lock()
            .expect("lock is not poisoned")
            .push(certificate.clone());
        Ok(certificate)
    }
}

/// An entry added to a [`FakeAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    /// The key type string, such as "ssh-ed25519-cert-v01@openssh.com".
    pub key_type: String,
    /// The certificate blob.
    pub blob: Bytes,
    pub comment: String,
    pub lifetime: Option<u32>,
}

impl AgentEntry {
    pub fn certificate(&self) -> anyhow::Result<Certificate> {
        Ok(Certificate::from_bytes(&self.blob)?)
    }
}

/// An ssh-agent that supports adding, listing, and removing identities.
pub struct FakeAgent {
    socket: PathBuf,
    entries: Arc<Mutex<Vec<AgentEntry>>>,
    halt_token: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl FakeAgent {
    /// Listen on `socket`.
    pub fn listen(socket: &Path) -> anyhow::Result<Self> {
        let listener = UnixListener::bind(socket)
            .with_context(|| format!("failed to bind {}", socket.display()))?;
        let entries = Arc::new(Mutex::new(vec![]));
        let halt_token = CancellationToken::new();

        let task_entries = entries.clone();
        let task_token = halt_token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break anyhow::Ok(()),
                    connection = listener.accept() => {
                        let (stream, _) = connection?;
                        let entries = task_entries.clone();
                        tokio::spawn(async move {
                            if let Err(error) = serve(stream, entries).await {
                                tracing::warn!(?error, "fake agent connection failed");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            socket: socket.to_path_buf(),
            entries,
            halt_token,
            task,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// A client for this agent.
    pub fn client(&self) -> SshAgent {
        SshAgent::new(&self.socket)
    }

    pub fn entries(&self) -> Vec<AgentEntry> {
        self.entries.lock().expect("lock is not poisoned").clone()
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        let _ = std::fs::remove_file(&self.socket);
        Ok(())
    }
}

async fn serve(mut stream: UnixStream, entries: Arc<Mutex<Vec<AgentEntry>>>) -> anyhow::Result<()> {
    loop {
        let length = match stream.read_u32().await {
            Ok(length) => length,
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        let mut request = vec![0; length as usize];
        stream.read_exact(&mut request).await?;
        let mut request = Bytes::from(request);

        let mut reply = BytesMut::new();
        match request.get_u8() {
            SSH_AGENTC_REQUEST_IDENTITIES => {
                let entries = entries.lock().expect("lock is not poisoned").clone();
                reply.put_u8(SSH_AGENT_IDENTITIES_ANSWER);
                reply.put_u32(entries.len().try_into()?);
                for entry in entries {
                    put_string(&mut reply, &entry.blob);
                    put_string(&mut reply, entry.comment.as_bytes());
                }
            }
            SSH_AGENTC_ADD_ID_CONSTRAINED => {
                let entry = parse_add(&mut request)?;
                entries.lock().expect("lock is not poisoned").push(entry);
                reply.put_u8(SSH_AGENT_SUCCESS);
            }
            SSH_AGENTC_REMOVE_IDENTITY => {
                let blob = read_string(&mut request)?;
                let mut entries = entries.lock().expect("lock is not poisoned");
                let before = entries.len();
                entries.retain(|entry| entry.blob != blob);
                reply.put_u8(if entries.len() < before {
                    SSH_AGENT_SUCCESS
                } else {
                    SSH_AGENT_FAILURE
                });
            }
            _ => reply.put_u8(SSH_AGENT_FAILURE),
        }

        stream.write_u32(reply.len().try_into()?).await?;
        stream.write_all(&reply).await?;
    }
}

fn parse_add(request: &mut Bytes) -> anyhow::Result<AgentEntry> {
    let key_type = String::from_utf8(read_string(request)?.to_vec())?;
    let blob = read_string(request)?;
    let private_fields = match key_type.as_str() {
        "ssh-ed25519-cert-v01@openssh.com" => 2,
        "ssh-rsa-cert-v01@openssh.com" => 4,
        other => anyhow::bail!("unsupported key type {other}"),
    };
    for _ in 0..private_fields {
        read_string(request)?;
    }
    let comment = String::from_utf8(read_string(request)?.to_vec())?;
    let mut lifetime = None;
    while request.has_remaining() {
        match request.get_u8() {
            SSH_AGENT_CONSTRAIN_LIFETIME if request.remaining() >= 4 => {
                lifetime = Some(request.get_u32())
            }
            other => anyhow::bail!("unsupported constraint {other}"),
        }
    }
    Ok(AgentEntry {
        key_type,
        blob,
        comment,
        lifetime,
    })
}

/// A client wired to a [`FakeService`] and, optionally, a [`FakeAgent`].
///
/// The state directory is removed when the instance is dropped.
pub struct Instance {
    pub service: Arc<FakeService>,
    pub agent: Option<FakeAgent>,
    pub client: Client,
    pub config: Config,
    pub state_dir: tempfile::TempDir,
    credentials: CredentialMaterial,
}

impl Instance {
    /// Create another client for the same service and agent, with a different configuration.
    ///
    /// The new client has its own cache.
    pub fn client_with(&self, config: Config) -> Client {
        new_client(
            config,
            &self.service,
            &self.credentials,
            self.agent.as_ref(),
        )
    }

    /// The path of the identity file, if one was created.
    pub fn identity_file(&self) -> Option<&Path> {
        self.config.identity_file.as_deref()
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        drop(self.client);
        if let Some(agent) = self.agent {
            agent.halt().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InstanceBuilder {
    service: Option<FakeService>,
    config: Config,
    credentials: CredentialMaterial,
    with_agent: bool,
    with_identity_file: bool,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            service: None,
            config: Config {
                use_agent: false,
                ..Default::default()
            },
            credentials: CredentialMaterial::Password {
                username: users::ALICE.to_string(),
                password: users::ALICE_PASSWORD.to_string(),
            },
            with_agent: false,
            with_identity_file: false,
        }
    }
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `service` rather than [`FakeService::standard`].
    pub fn with_service(mut self, service: FakeService) -> Self {
        self.service = Some(service);
        self
    }

    /// The client configuration. `identity_file` is replaced if [`Self::with_identity_file`] is
    /// used, and `use_agent` is set if [`Self::with_agent`] is used.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialMaterial) -> Self {
        self.credentials = credentials;
        self
    }

    /// Log in as bob rather than alice.
    pub fn as_bob(self) -> Self {
        self.with_credentials(CredentialMaterial::Password {
            username: users::BOB.to_string(),
            password: users::BOB_PASSWORD.to_string(),
        })
    }

    /// Start a [`FakeAgent`] and deliver certificates to it.
    pub fn with_agent(mut self) -> Self {
        self.with_agent = true;
        self
    }

    /// Create an unencrypted Ed25519 identity file named `id_ed25519` in the state directory.
    pub fn with_identity_file(mut self) -> Self {
        self.with_identity_file = true;
        self
    }

    pub async fn build(self) -> anyhow::Result<Instance> {
        let state_dir = tempfile::TempDir::new()?;
        let service = Arc::new(match self.service {
            Some(service) => service,
            None => FakeService::standard()?,
        });

        let mut config = self.config;
        if self.with_identity_file {
            let path = state_dir.path().join("id_ed25519");
            let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
            std::fs::write(&path, key.to_openssh(LineEnding::LF)?.as_bytes())?;
            config.identity_file = Some(path);
        }

        let agent = if self.with_agent {
            config.use_agent = true;
            Some(FakeAgent::listen(&state_dir.path().join("agent.socket"))?)
        } else {
            None
        };

        Ok(Instance {
            client: new_client(config.clone(), &service, &self.credentials, agent.as_ref()),
            service,
            agent,
            config,
            state_dir,
            credentials: self.credentials,
        })
    }
}

fn new_client(
    config: Config,
    service: &Arc<FakeService>,
    credentials: &CredentialMaterial,
    agent: Option<&FakeAgent>,
) -> Client {
    Client::new(
        config,
        service.clone(),
        service.clone(),
        Arc::new(StaticCredentials(credentials.clone())),
        agent.map(|agent| Arc::new(agent.client()) as Arc<dyn AgentStore>),
    )
}
