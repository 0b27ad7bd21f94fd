// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Keyscribe

Keyscribe obtains short-lived SSH certificates from a remote certificate-issuing service and keeps
them fresh. Rather than running a separate signing ceremony before every SSH login, a user (or an
automated agent) runs `keyscribe req` and ends up with a signed certificate in their ssh-agent, on
disk next to their identity file, or both.

## Components

The heart of the crate is the [`client::Client`], which drives a single login:

1. The [`cache::CertificateCache`] is consulted first. If a certificate for the identity is still
   valid, it's returned without touching the network.
2. Otherwise the available authentication endpoints are discovered ([`discovery`]) and narrowed to
   the configured [`discovery::EndpointSelection`].
3. A key pair is loaded from the identity file or generated ad-hoc ([`key::KeySource`]).
4. The client authenticates against each selected endpoint and requests a certificate for the
   principals that survive the include/exclude patterns ([`principals::PrincipalFilter`]).
5. The new certificate is cached and handed to the [`sink::OutputSink`], which writes files
   atomically and/or registers the key with a running ssh-agent ([`agent`]).

The network protocol to the signing service sits behind the traits in [`transport`]; an HTTP/JSON
implementation is provided in [`transport::http`].

## Crate features

* **cli** -
  Include the `keyscribe` command-line interface along with the configuration file loader. This is
  a default feature.
*/

pub mod agent;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod key;
pub mod principals;
pub mod sink;
#[cfg(test)]
mod testing;
pub mod transport;
