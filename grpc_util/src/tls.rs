// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Cursor;

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// TLS configuration for remote endpoints: an optional root CA bundle and an
/// optional client certificate/key pair for mutual TLS. With neither set, the
/// system trust store is used and no client authentication is offered.
#[derive(Clone, Default)]
pub struct Config {
    /// PEM bytes of the root CA bundle to trust instead of the system store.
    pub root_ca_certs: Option<Vec<u8>>,
    /// PEM bytes of the client certificate chain and private key for mTLS.
    pub mtls: Option<MtlsConfig>,
}

#[derive(Clone)]
pub struct MtlsConfig {
    pub cert_chain: Vec<u8>,
    pub key: Vec<u8>,
}

impl Config {
    pub fn new<Buf: AsRef<[u8]>>(
        root_ca_certs: Option<Buf>,
        mtls: Option<(Buf, Buf)>,
    ) -> Result<Self, String> {
        // Validate the PEM payloads eagerly so misconfiguration fails at
        // startup rather than on the first RPC.
        fn parse_certs(raw: &[u8], what: &str) -> Result<(), String> {
            let certs = rustls_pemfile::certs(&mut Cursor::new(raw))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("Failed to parse {what}: {e}"))?;
            if certs.is_empty() {
                return Err(format!("No certificates found in {what}"));
            }
            Ok(())
        }

        if let Some(raw) = root_ca_certs.as_ref() {
            parse_certs(raw.as_ref(), "TLS root CA certs data")?;
        }
        if let Some((cert, key)) = mtls.as_ref() {
            parse_certs(cert.as_ref(), "client authentication (mTLS) certs data")?;
            rustls_pemfile::private_key(&mut Cursor::new(key.as_ref()))
                .map_err(|e| format!("Failed to parse client authentication (mTLS) key: {e}"))?
                .ok_or_else(|| {
                    "No private key found in client authentication (mTLS) key data".to_owned()
                })?;
        }

        Ok(Config {
            root_ca_certs: root_ca_certs.map(|b| b.as_ref().to_vec()),
            mtls: mtls.map(|(cert, key)| MtlsConfig {
                cert_chain: cert.as_ref().to_vec(),
                key: key.as_ref().to_vec(),
            }),
        })
    }

    pub fn new_without_mtls<Buf: AsRef<[u8]>>(root_ca_certs: Option<Buf>) -> Result<Self, String> {
        Self::new(root_ca_certs, None)
    }

    pub(crate) fn to_client_tls_config(&self) -> Result<ClientTlsConfig, String> {
        let mut tls = match &self.root_ca_certs {
            Some(ca) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)),
            None => ClientTlsConfig::new().with_native_roots(),
        };
        if let Some(mtls) = &self.mtls {
            tls = tls.identity(Identity::from_pem(&mtls.cert_chain, &mtls.key));
        }
        Ok(tls)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn rejects_malformed_pem() {
        assert!(Config::new_without_mtls(Some(b"not pem".as_slice())).is_err());
        assert!(Config::new(None, Some((b"bad".as_slice(), b"bad".as_slice()))).is_err());
    }

    #[test]
    fn accepts_absent_material() {
        let config = Config::new_without_mtls(None::<&[u8]>).unwrap();
        assert!(config.root_ca_certs.is_none());
        assert!(config.mtls.is_none());
    }
}
