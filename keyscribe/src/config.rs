// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(feature = "cli")]
use anyhow::Context;

use crate::client::Config;

/// The identity name used when a key is generated without an identity file.
pub const ADHOC_IDENTITY: &str = "adhoc";

/// The identity a certificate is requested for, derived from a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The name the certificate is cached and registered with the agent under.
    ///
    /// This is the resolved path of the identity file (see [`identity_name`]), or
    /// [`ADHOC_IDENTITY`] when there is no identity file.
    pub name: String,
    /// The identity file. Generated keys are written here when files are requested.
    pub key_path: Option<PathBuf>,
    /// The requested certificate lifetime; `None` leaves it up to the service.
    pub lifetime: Option<Duration>,
    pub use_agent: bool,
    pub write_cert: bool,
    pub generate: bool,
}

impl Identity {
    pub fn from_config(config: &Config) -> Self {
        let name = config
            .identity_file
            .as_deref()
            .map(identity_name)
            .unwrap_or_else(|| ADHOC_IDENTITY.to_string());
        Self {
            name,
            key_path: config.identity_file.clone(),
            lifetime: config.cert_lifetime,
            use_agent: config.use_agent,
            write_cert: config.write_cert,
            generate: config.generate_keypair,
        }
    }
}

/// The identity name for the identity file at `path`.
///
/// The file's directory is canonicalized so the name doesn't change once a generated key is
/// written, and two files with the same name in different directories are told apart. If the
/// directory can't be resolved, the path is made absolute against the working directory.
pub fn identity_name(path: &Path) -> String {
    let resolved = match (path.parent(), path.file_name()) {
        (Some(parent), Some(file_name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .ok()
                .map(|parent| parent.join(file_name))
        }
        _ => None,
    };
    resolved
        .or_else(|| std::path::absolute(path).ok())
        .unwrap_or_else(|| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// The directory user configuration lives in: `$XDG_CONFIG_HOME`, falling back to
/// `$HOME/.config`.
#[cfg(feature = "cli")]
pub fn config_home() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to the user's configuration
/// directory (see [`config_home`]), is checked. If the default config doesn't exist, the
/// [`Default`] implementation is returned.
///
/// # Errors
///
/// In the event that `path` is given but can't be read, or that one of the config files exists
/// but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        config_home()
            .or_else(|| {
                tracing::debug!("Neither XDG_CONFIG_HOME nor HOME is set");
                None
            })
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::debug!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::debug!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_path() {
        let config = Config {
            identity_file: Some(PathBuf::from("/does/not/exist/.ssh/id_work")),
            cert_lifetime: Some(Duration::from_secs(600)),
            write_cert: true,
            ..Default::default()
        };
        let identity = Identity::from_config(&config);
        assert_eq!("/does/not/exist/.ssh/id_work", identity.name);
        assert_eq!(config.identity_file, identity.key_path);
        assert_eq!(Some(Duration::from_secs(600)), identity.lifetime);
        assert!(identity.write_cert);
        assert!(!identity.generate);
    }

    // Identity files that share a file name are distinct identities.
    #[test]
    fn same_file_name_different_directories() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let name_a = identity_name(&a.path().join("id_ed25519"));
        let name_b = identity_name(&b.path().join("id_ed25519"));
        assert_ne!(name_a, name_b);
        assert_eq!(
            a.path()
                .canonicalize()?
                .join("id_ed25519")
                .to_string_lossy()
                .into_owned(),
            name_a
        );

        Ok(())
    }

    // The name is the same before and after the key file exists, and for relative paths.
    #[test]
    fn name_is_stable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("id_ed25519");
        let before = identity_name(&key_path);
        std::fs::write(&key_path, "")?;
        assert_eq!(before, identity_name(&key_path));

        let relative = identity_name(Path::new("id_ed25519"));
        assert!(Path::new(&relative).is_absolute());
        assert!(relative.ends_with("id_ed25519"));

        Ok(())
    }

    #[test]
    fn adhoc_identity() {
        let config = Config {
            generate_keypair: true,
            ..Default::default()
        };
        let identity = Identity::from_config(&config);
        assert_eq!(ADHOC_IDENTITY, identity.name);
        assert!(identity.generate);
        assert_eq!(None, identity.key_path);
    }

    #[cfg(feature = "cli")]
    #[test]
    fn load_explicit_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
server_url = "https://ca.internal.example.com"
cert_lifetime = "1h 30m"
login_endpoints = ["corp", "github"]
include_principals = "web-*"
"#,
        )?;

        let config: Config = load_config(Some(path), Path::new("keyscribe/config.toml"))?;
        assert_eq!("https://ca.internal.example.com", config.server_url);
        assert_eq!(Some(Duration::from_secs(5400)), config.cert_lifetime);
        assert_eq!(
            crate::discovery::EndpointSelection::Named(vec!["corp".into(), "github".into()]),
            config.login_endpoints
        );
        assert_eq!(Some("web-*".to_string()), config.include_principals);
        // Everything else keeps its default
        assert_eq!(Config::default().request_timeout, config.request_timeout);

        Ok(())
    }

    #[cfg(feature = "cli")]
    #[test]
    fn load_invalid_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cert_lifetime = \"a while\"\n")?;

        let result: anyhow::Result<Config> = load_config(Some(path), Path::new("config.toml"));
        assert!(result.is_err());

        Ok(())
    }

    #[cfg(feature = "cli")]
    #[test]
    fn load_missing_explicit_path() {
        let result: anyhow::Result<Config> = load_config(
            Some(PathBuf::from("/does/not/exist.toml")),
            Path::new("config.toml"),
        );
        assert!(result.is_err());
    }

    // The default configuration renders as a file that parses back to itself.
    #[cfg(feature = "cli")]
    #[test]
    fn default_config_is_valid() -> anyhow::Result<()> {
        let rendered = Config::default().to_string();
        assert!(!rendered.is_empty());
        let parsed: Config = toml::from_str(&rendered)?;
        assert_eq!(Config::default(), parsed);

        Ok(())
    }
}
