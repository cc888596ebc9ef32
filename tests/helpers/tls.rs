use boring::pkey::PKey;
use boring::ssl::{SslAcceptor, SslMethod};
use boring::x509::X509;

/// A TLS acceptor with a fresh self-signed certificate for 127.0.0.1.
///
/// The certificate is never trusted by anyone; knock does not verify peers.
pub fn self_signed_acceptor() -> SslAcceptor {
    let subject_alt_names = vec!["127.0.0.1".to_string(), "localhost".to_string()];

    let cert =
        rcgen::generate_simple_self_signed(subject_alt_names).expect("Failed to generate cert");
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    let pkey = PKey::private_key_from_pem(key_pem.as_bytes()).expect("Failed to parse private key");
    let x509 = X509::from_pem(cert_pem.as_bytes()).expect("Failed to parse certificate");

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .expect("Failed to create SslAcceptor builder");
    builder
        .set_private_key(&pkey)
        .expect("Failed to set private key");
    builder
        .set_certificate(&x509)
        .expect("Failed to set certificate");
    builder.set_alpn_select_callback(|_, client_protos| {
        boring::ssl::select_next_proto(b"\x08http/1.1", client_protos)
            .ok_or(boring::ssl::AlpnError::NOACK)
    });
    builder.build()
}
