// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Registering keys and certificates with an ssh-agent.
//!
//! [`SshAgent`] implements just enough of the ssh-agent protocol (draft-miller-ssh-agent) to add a
//! certificate with a lifetime constraint, list identities, and remove them again. Identities added
//! by this crate carry the comment `keyscribe:<identity>` so they can be found on logout.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ssh_key::{private::KeypairData, Certificate};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::{error::AgentError, key::KeyPair};

/// The environment variable naming the agent's socket.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
pub const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;

// Replies larger than this are treated as a protocol error.
const MAX_MESSAGE_SIZE: u32 = 256 * 1024;

/// A store for decrypted keys and their certificates that other programs can use.
#[async_trait]
pub trait AgentStore: Debug + Send + Sync {
    /// Add `key` and `certificate` for `identity`, replacing any earlier certificate for the same
    /// identity. If `lifetime` is provided, the agent drops the key after that long.
    async fn add_identity(
        &self,
        identity: &str,
        key: &KeyPair,
        certificate: &Certificate,
        lifetime: Option<Duration>,
    ) -> Result<(), AgentError>;

    /// Remove everything added for `identity`, returning the number of entries removed.
    async fn remove_identity(&self, identity: &str) -> Result<usize, AgentError>;
}

/// The comment attached to agent entries for `identity`.
pub fn identity_comment(identity: &str) -> String {
    format!("keyscribe:{identity}")
}

/// A connection to an OpenSSH-compatible agent over its Unix socket.
#[derive(Debug, Clone)]
pub struct SshAgent {
    socket: PathBuf,
}

impl SshAgent {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// The agent named by `$SSH_AUTH_SOCK`, if the variable is set.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(AUTH_SOCK_ENV)
            .filter(|socket| !socket.is_empty())
            .map(Self::new)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> Result<UnixStream, AgentError> {
        UnixStream::connect(&self.socket).await.map_err(|error| {
            AgentError::Unavailable(format!("{}: {error}", self.socket.display()))
        })
    }

    // Send a single request and return the reply's message type and body.
    async fn request(&self, message: Bytes) -> Result<(u8, Bytes), AgentError> {
        let mut stream = self.connect().await?;
        let mut frame = BytesMut::with_capacity(message.len() + 4);
        frame.put_u32(message.len().try_into().map_err(|_| {
            AgentError::Io(std::io::Error::other("agent request is too large"))
        })?);
        frame.put(message);
        stream.write_all(&frame).await?;

        let length = stream.read_u32().await?;
        if length == 0 || length > MAX_MESSAGE_SIZE {
            return Err(AgentError::UnexpectedReply(0));
        }
        let mut reply = vec![0; length as usize];
        stream.read_exact(&mut reply).await?;
        let mut reply = Bytes::from(reply);
        let message_type = reply.get_u8();
        Ok((message_type, reply))
    }

    /// List the public key blobs and comments of every identity in the agent.
    pub async fn list_identities(&self) -> Result<Vec<(Bytes, String)>, AgentError> {
        let (message_type, mut body) = self
            .request(Bytes::from_static(&[SSH_AGENTC_REQUEST_IDENTITIES]))
            .await?;
        if message_type != SSH_AGENT_IDENTITIES_ANSWER {
            return Err(AgentError::UnexpectedReply(message_type));
        }
        let count = read_u32(&mut body)?;
        let mut identities = Vec::new();
        for _ in 0..count {
            let blob = read_string(&mut body)?;
            let comment = read_string(&mut body)?;
            identities.push((blob, String::from_utf8_lossy(&comment).into_owned()));
        }
        Ok(identities)
    }

    async fn remove_blob(&self, blob: Bytes) -> Result<bool, AgentError> {
        let mut message = BytesMut::new();
        message.put_u8(SSH_AGENTC_REMOVE_IDENTITY);
        put_string(&mut message, &blob);
        match self.request(message.freeze()).await? {
            (SSH_AGENT_SUCCESS, _) => Ok(true),
            (SSH_AGENT_FAILURE, _) => Ok(false),
            (other, _) => Err(AgentError::UnexpectedReply(other)),
        }
    }
}

#[async_trait]
impl AgentStore for SshAgent {
    #[tracing::instrument(level = "debug", skip(self, key, certificate), err)]
    async fn add_identity(
        &self,
        identity: &str,
        key: &KeyPair,
        certificate: &Certificate,
        lifetime: Option<Duration>,
    ) -> Result<(), AgentError> {
        let removed = self.remove_identity(identity).await?;
        if removed > 0 {
            tracing::debug!(removed, "Replaced earlier certificates in the agent");
        }
        let message =
            add_identity_message(&identity_comment(identity), key, certificate, lifetime)?;
        match self.request(message).await? {
            (SSH_AGENT_SUCCESS, _) => Ok(()),
            (SSH_AGENT_FAILURE, _) => Err(AgentError::Refused),
            (other, _) => Err(AgentError::UnexpectedReply(other)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn remove_identity(&self, identity: &str) -> Result<usize, AgentError> {
        let comment = identity_comment(identity);
        let mut removed = 0;
        for (blob, _) in self
            .list_identities()
            .await?
            .into_iter()
            .filter(|(_, entry_comment)| entry_comment == &comment)
        {
            if self.remove_blob(blob).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Build an `SSH_AGENTC_ADD_ID_CONSTRAINED` message for a certificate and its private key.
///
/// Only Ed25519 and RSA keys are supported.
pub fn add_identity_message(
    comment: &str,
    key: &KeyPair,
    certificate: &Certificate,
    lifetime: Option<Duration>,
) -> Result<Bytes, AgentError> {
    let mut message = BytesMut::new();
    message.put_u8(SSH_AGENTC_ADD_ID_CONSTRAINED);
    match key.private_key().key_data() {
        KeypairData::Ed25519(keypair) => {
            put_string(&mut message, b"ssh-ed25519-cert-v01@openssh.com");
            put_string(&mut message, &certificate.to_bytes()?);
            put_string(&mut message, &keypair.public.0);
            put_string(&mut message, &keypair.to_bytes());
        }
        KeypairData::Rsa(keypair) => {
            put_string(&mut message, b"ssh-rsa-cert-v01@openssh.com");
            put_string(&mut message, &certificate.to_bytes()?);
            // Mpint::as_bytes is already in the mpint wire encoding.
            put_string(&mut message, keypair.private.d.as_bytes());
            put_string(&mut message, keypair.private.iqmp.as_bytes());
            put_string(&mut message, keypair.private.p.as_bytes());
            put_string(&mut message, keypair.private.q.as_bytes());
        }
        _other => {
            return Err(AgentError::UnsupportedKey(
                key.private_key().algorithm().to_string(),
            ));
        }
    }
    put_string(&mut message, comment.as_bytes());
    if let Some(lifetime) = lifetime {
        message.put_u8(SSH_AGENT_CONSTRAIN_LIFETIME);
        message.put_u32(lifetime.as_secs().clamp(1, u32::MAX.into()) as u32);
    }
    Ok(message.freeze())
}

/// Append a length-prefixed string to an agent message.
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    // Agent messages are far smaller than 4GiB.
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn read_u32(buf: &mut Bytes) -> Result<u32, AgentError> {
    if buf.remaining() < 4 {
        return Err(AgentError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(buf.get_u32())
}

/// Read a length-prefixed string from an agent message.
pub fn read_string(buf: &mut Bytes) -> Result<Bytes, AgentError> {
    let length = read_u32(buf)? as usize;
    if buf.remaining() < length {
        return Err(AgentError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(buf.split_to(length))
}
