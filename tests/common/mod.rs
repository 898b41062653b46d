//! TLS fixture helpers shared by the integration tests. Builds a small
//! self-signed CA and leaf certificates with `rcgen`, mirroring the pattern
//! `sp_transport::test_support` uses internally for unit tests — duplicated
//! here since `tests/` binaries can't reach a crate's private `#[cfg(test)]`
//! module.

use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, IsCa};

pub struct Ca {
    cert_der: Vec<u8>,
    cert: rcgen::Certificate,
}

impl Ca {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(vec!["test-ca".to_string()]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = rcgen::Certificate::from_params(params).expect("generate CA");
        let cert_der = cert.serialize_der().expect("serialize CA cert");
        Self { cert_der, cert }
    }

    pub fn root_store(&self) -> rustls::RootCertStore {
        let mut store = rustls::RootCertStore::empty();
        store
            .add(&rustls::Certificate(self.cert_der.clone()))
            .expect("add CA to root store");
        store
    }

    /// Issues a leaf certificate for `name`, signed by this CA.
    pub fn issue(&self, name: &str) -> (rustls::Certificate, rustls::PrivateKey) {
        let params = CertificateParams::new(vec![name.to_string()]);
        let leaf = rcgen::Certificate::from_params(params).expect("generate leaf");
        let cert_der = leaf
            .serialize_der_with_signer(&self.cert)
            .expect("sign leaf with CA");
        let key_der = leaf.serialize_private_key_der();
        (rustls::Certificate(cert_der), rustls::PrivateKey(key_der))
    }
}

pub fn server_config(cert: rustls::Certificate, key: rustls::PrivateKey) -> Arc<rustls::ServerConfig> {
    Arc::new(
        rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .expect("build server config"),
    )
}

pub fn client_config(roots: rustls::RootCertStore) -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// A client config that trusts nothing at all, so any server certificate
/// fails verification (used by S6).
pub fn no_trust_client_config() -> Arc<rustls::ClientConfig> {
    client_config(rustls::RootCertStore::empty())
}
