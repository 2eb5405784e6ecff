// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

pub mod retry;
pub mod tls;

/// Normalize a user-supplied address into a URI scheme tonic understands.
///
/// `grpc://` and `grpcs://` map to plain and TLS HTTP/2 respectively; bare
/// `host:port` defaults to plain.
pub fn normalize_address(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = addr.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_owned()
    } else {
        format!("http://{addr}")
    }
}

/// Whether the given (unnormalized) address requires TLS.
pub fn address_is_tls(addr: &str) -> bool {
    normalize_address(addr).starts_with("https://")
}

/// Create a tonic `Endpoint` from a string containing a scheme and
/// IP address/name.
pub fn create_endpoint(addr: &str, tls_config: Option<&tls::Config>) -> Result<Endpoint, String> {
    let uri = normalize_address(addr);
    let use_tls = uri.starts_with("https://");

    let mut endpoint =
        Endpoint::from_shared(uri).map_err(|err| format!("invalid address: {err}"))?;

    if use_tls {
        let tls = match tls_config {
            Some(config) => config.to_client_tls_config()?,
            None => tls::Config::default().to_client_tls_config()?,
        };
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|err| format!("TLS setup error: {err}"))?;
    }

    // Keep-alive so that long-polled execution streams survive idle periods.
    let endpoint = endpoint
        .connect_timeout(Duration::from_secs(30))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Create a lazily-connecting channel to the given address. The underlying
/// transport multiplexes, so one channel is shared by all service stubs.
pub fn create_channel(addr: &str, tls_config: Option<&tls::Config>) -> Result<Channel, String> {
    Ok(create_endpoint(addr, tls_config)?.connect_lazy())
}

pub fn status_to_str(status: tonic::Status) -> String {
    status_ref_to_str(&status)
}

pub fn status_ref_to_str(status: &tonic::Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}
