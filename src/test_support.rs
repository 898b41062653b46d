//! Self-signed cert generation shared by unit and integration tests.
//! Not part of the public API; gated entirely behind `#[cfg(test)]`.

#![cfg(test)]

/// Generates a self-signed certificate/key pair valid for `name`.
pub fn self_signed(name: &str) -> (rustls::Certificate, rustls::PrivateKey) {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("self-signed cert generation");
    let cert_der = cert.serialize_der().expect("serialize cert");
    let key_der = cert.serialize_private_key_der();
    (rustls::Certificate(cert_der), rustls::PrivateKey(key_der))
}
