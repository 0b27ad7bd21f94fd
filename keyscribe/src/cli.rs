// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The `keyscribe` command-line interface.
//!
//! Flags are bound here and folded into a [`Config`]; nothing below this module knows about
//! them.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use async_trait::async_trait;
use clap::{builder::FalseyValueParser, ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{AgentStore, SshAgent},
    client::{Client, Config, LoginResult},
    config::load_config,
    discovery::{AuthEndpoint, CredentialType, EndpointSelection},
    error::{ClientError, KeyError, TransportError},
    sink::DeliveryReport,
    transport::{CredentialMaterial, CredentialSource, HttpTransport},
};

/// The path, relative to $XDG_CONFIG_HOME, of the default config file location.
pub const DEFAULT_CONFIG: &str = "keyscribe/config.toml";

/// Obtain and renew short-lived SSH certificates.
///
/// Settings are read from the configuration file first; any flag given on the command line
/// takes precedence.
#[derive(Debug, Parser)]
#[command(name = "keyscribe", version)]
pub struct Cli {
    /// The path to the configuration file.
    ///
    /// If no path is provided, the configuration file at $XDG_CONFIG_HOME/keyscribe/config.toml
    /// is used, if it exists. If it does not exist, the configuration defaults are used.
    ///
    /// To view the effective configuration, run the `config` subcommand.
    #[arg(long, short, env = "KEYSCRIBE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// The OpenSSH private key to request a certificate for.
    #[arg(long, short, env = "KEYSCRIBE_IDENTITY", global = true)]
    pub identity: Option<PathBuf>,

    /// The certificate lifetime to request, such as "10m" or "1h30m".
    #[arg(
        long,
        short,
        env = "KEYSCRIBE_EXPIRE",
        value_parser = humantime::parse_duration,
        global = true
    )]
    pub expire: Option<Duration>,

    /// Write the certificate (and generated keys) next to the identity file.
    ///
    /// The environment variable accepts "0", "false", "no", or "off" to leave this unset.
    #[arg(
        long,
        short,
        env = "KEYSCRIBE_WRITE",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub write: bool,

    /// Request a new certificate even if the current one is still valid.
    #[arg(
        long,
        env = "KEYSCRIBE_RENEW",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub renew: bool,

    /// Add the key and certificate to the ssh-agent.
    ///
    /// Setting KEYSCRIBE_USE_AGENT=0 is the same as passing --no-agent.
    #[arg(
        long,
        env = "KEYSCRIBE_USE_AGENT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_name = "BOOL",
        value_parser = FalseyValueParser::new(),
        overrides_with = "no_agent",
        global = true
    )]
    pub agent: Option<bool>,

    /// Don't add the key and certificate to the ssh-agent.
    #[arg(long, overrides_with = "agent", global = true)]
    pub no_agent: bool,

    /// Generate a new Ed25519 key pair rather than using the identity file.
    #[arg(
        long,
        short,
        env = "KEYSCRIBE_GENKEY",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub generate: bool,

    /// A comma-separated list of authentication endpoints to log in with.
    ///
    /// Run `keyscribe req --list-logins` to see the endpoints the service offers.
    #[arg(
        long,
        short,
        env = "KEYSCRIBE_LOGIN",
        value_delimiter = ',',
        global = true
    )]
    pub login: Vec<String>,

    /// Only request principals matching this glob pattern, such as "web-*".
    #[arg(long, env = "KEYSCRIBE_INCLUDE", global = true)]
    pub include: Option<String>,

    /// Don't request principals matching this glob pattern.
    #[arg(long, env = "KEYSCRIBE_EXCLUDE", global = true)]
    pub exclude: Option<String>,

    /// A principal to request; may be given multiple times. By default, every principal the
    /// service allows is requested.
    #[arg(long = "principal", global = true)]
    pub principals: Vec<String>,

    /// The base URL of the certificate-issuing service.
    #[arg(long, env = "KEYSCRIBE_URL", global = true)]
    pub url: Option<String>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(
        long,
        env = "KEYSCRIBE_LOG",
        default_value = "WARN,keyscribe=INFO",
        global = true
    )]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Obtain a certificate, reusing the current one if it's still valid, and deliver it.
    Req {
        /// Forget the current certificate: remove it from the ssh-agent and delete its files.
        #[arg(long, conflicts_with = "list_logins")]
        clear: bool,
        /// List the authentication endpoints the service offers and exit.
        #[arg(long)]
        list_logins: bool,
    },
    /// See the current configuration, or the defaults if no configuration file is supplied.
    Config,
}

impl Cli {
    /// Override `config` with any settings given on the command line.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(identity) = &self.identity {
            config.identity_file = Some(identity.clone());
        }
        if let Some(expire) = self.expire {
            config.cert_lifetime = Some(expire);
        }
        if let Some(url) = &self.url {
            config.server_url = url.clone();
        }
        if let Some(include) = &self.include {
            config.include_principals = Some(include.clone());
        }
        if let Some(exclude) = &self.exclude {
            config.exclude_principals = Some(exclude.clone());
        }
        if !self.login.is_empty() {
            config.login_endpoints = EndpointSelection::from(self.login.clone());
        }
        if !self.principals.is_empty() {
            config.principals = self.principals.clone();
        }
        config.write_cert |= self.write;
        config.always_renew |= self.renew;
        config.generate_keypair |= self.generate;
        // --no-agent wins over a KEYSCRIBE_USE_AGENT setting, and the last of --agent and
        // --no-agent wins on the command line.
        if self.no_agent {
            config.use_agent = false;
        } else if let Some(agent) = self.agent {
            config.use_agent = agent;
        }
        config
    }
}

/// Prompts on the terminal for endpoint credentials.
#[derive(Debug, Clone, Default)]
pub struct PromptCredentials {
    username: Option<String>,
}

impl PromptCredentials {
    /// Create a prompt. If `username` is provided, only the password is asked for.
    pub fn new(username: Option<String>) -> Self {
        Self { username }
    }
}

#[async_trait]
impl CredentialSource for PromptCredentials {
    async fn credentials(
        &self,
        endpoint: &AuthEndpoint,
    ) -> Result<CredentialMaterial, TransportError> {
        let prompt_error = |reason: String| TransportError::Credentials {
            endpoint: endpoint.name.clone(),
            reason,
        };
        match endpoint.credential_type {
            CredentialType::UserPassword => {
                let username = self.username.clone();
                let realm = endpoint.realm.clone();
                tokio::task::spawn_blocking(move || prompt_password(username, &realm))
                    .await
                    .map_err(|error| prompt_error(error.to_string()))?
                    .map_err(|error| prompt_error(error.to_string()))
            }
            CredentialType::Federated => Err(prompt_error(
                "browser-based login can't be completed from a terminal prompt".to_string(),
            )),
            CredentialType::Other => Ok(CredentialMaterial::None),
        }
    }
}

fn prompt_password(
    username: Option<String>,
    realm: &str,
) -> Result<CredentialMaterial, dialoguer::Error> {
    let username = match username {
        Some(username) => username,
        None => dialoguer::Input::<String>::new()
            .with_prompt(format!("Username for {realm}"))
            .interact_text()?,
    };
    let password = dialoguer::Password::new()
        .with_prompt(format!("Password for {username}@{realm}"))
        .interact()?;
    Ok(CredentialMaterial::Password { username, password })
}

fn build_client(config: Config) -> anyhow::Result<Client> {
    let transport = Arc::new(
        HttpTransport::builder(&config.server_url)
            .timeout(config.request_timeout)
            .ca_certificate(config.ca_certificate.clone())
            .build()
            .context("failed to set up the HTTP client")?,
    );
    let agent = SshAgent::from_env().map(|agent| Arc::new(agent) as Arc<dyn AgentStore>);
    if config.use_agent && agent.is_none() {
        tracing::warn!("SSH_AUTH_SOCK is not set; the certificate can't be added to an ssh-agent");
    }
    let credentials = Arc::new(PromptCredentials::new(config.username.clone()));
    Ok(Client::new(
        config,
        transport.clone(),
        transport,
        credentials,
        agent,
    ))
}

fn print_result(result: &LoginResult, report: &DeliveryReport) {
    let expires = humantime::format_rfc3339_seconds(result.expiry);
    let remaining = Duration::from_secs(result.remaining(SystemTime::now()).as_secs());
    if result.from_cache {
        println!("Using the current certificate for {}", result.identity);
    } else {
        println!("Obtained a new certificate for {}", result.identity);
    }
    println!("  principals: {}", result.principals().join(", "));
    println!(
        "  expires:    {expires} (in {})",
        humantime::format_duration(remaining)
    );
    println!("  serial:     {}", result.certificate.serial());
    if !result.endpoints.is_empty() {
        println!("  logins:     {}", result.endpoints.join(", "));
    }
    for destination in &report.delivered {
        println!("  {destination}");
    }
}

async fn request(config: Config) -> anyhow::Result<()> {
    let prompt_for_passphrase = config.identity_passphrase.is_none();
    let mut client = build_client(config.clone())?;
    let mut outcome = client.login_and_deliver().await;
    if let Err(ClientError::Key(KeyError::Passphrase { path })) = &outcome {
        if prompt_for_passphrase {
            let prompt = format!("Passphrase for {}", path.display());
            let passphrase = tokio::task::spawn_blocking(move || {
                dialoguer::Password::new().with_prompt(prompt).interact()
            })
            .await??;
            client = build_client(Config {
                identity_passphrase: Some(passphrase),
                ..config
            })?;
            outcome = client.login_and_deliver().await;
        }
    }

    match outcome {
        Ok((result, report)) => {
            print_result(&result, &report);
            Ok(())
        }
        Err(ClientError::Delivery(error)) => {
            if let Some(report) = error.report().filter(|r| !r.delivered.is_empty()) {
                eprintln!("The certificate was only partially delivered: {report}");
            }
            Err(ClientError::Delivery(error).into())
        }
        Err(error) => Err(error.into()),
    }
}

async fn execute(config: Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Req {
            list_logins: true, ..
        } => {
            let endpoints = build_client(config)?.get_authenticators().await?;
            for endpoint in endpoints {
                println!("{endpoint}");
            }
            Ok(())
        }
        Command::Req { clear: true, .. } => {
            let client = build_client(config)?;
            client.logout().await?;
            println!("Cleared the certificate for {}", client.identity().name);
            Ok(())
        }
        Command::Req { .. } => request(config).await,
        Command::Config => unreachable!("Command handled prior to this match"),
    }
}

/// Run the command described by `cli`.
///
/// Ctrl-C aborts any in-flight request; nothing is cached or written for an interrupted login.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config::<Config>(cli.config.clone(), Path::new(DEFAULT_CONFIG))?;
    let config = cli.apply(config);

    if let Command::Config = cli.command {
        println!(
            "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
        );
        return Ok(());
    }

    let halt_token = CancellationToken::new();
    let signal_token = halt_token.clone();
    let signal_handler = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; shutting down");
            signal_token.cancel();
        }
    });

    let result = tokio::select! {
        _ = halt_token.cancelled() => Err(anyhow::anyhow!("interrupted")),
        result = execute(config, cli.command) => result,
    };
    signal_handler.abort();
    result
}
