//! Server trust evaluation for the live transport.
//!
//! The default policy is a narrow host pin, not certificate validation: a
//! server presenting itself under the configured base URL's host is trusted
//! without chain verification, every other host goes through the regular
//! webpki checks. Handshake signatures are always verified.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::Error;

#[derive(Clone, Debug, Default)]
pub enum TrustPolicy {
    /// Accept the base URL's host as-is, validate everything else normally.
    #[default]
    PinnedToBaseHost,
    /// Regular webpki validation for every host.
    PlatformDefault,
    /// Replace trust evaluation entirely.
    Custom(Arc<dyn ServerCertVerifier>),
}

#[derive(Debug)]
pub(crate) struct BaseHostVerifier {
    host: Option<String>,
    platform: Arc<dyn ServerCertVerifier>,
}

impl BaseHostVerifier {
    pub(crate) fn new(host: Option<String>, platform: Arc<dyn ServerCertVerifier>) -> Self {
        Self {
            host: host.map(|host| host.to_ascii_lowercase()),
            platform,
        }
    }

    pub(crate) fn accepts_host(&self, server_name: &ServerName<'_>) -> bool {
        let Some(pinned) = &self.host else {
            return false;
        };
        server_name_host(server_name).is_some_and(|host| host == *pinned)
    }
}

fn server_name_host(server_name: &ServerName<'_>) -> Option<String> {
    match server_name {
        ServerName::DnsName(name) => Some(name.as_ref().to_ascii_lowercase()),
        ServerName::IpAddress(address) => Some(std::net::IpAddr::from(*address).to_string()),
        _ => None,
    }
}

impl ServerCertVerifier for BaseHostVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.accepts_host(server_name) {
            return Ok(ServerCertVerified::assertion());
        }
        self.platform
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.platform.supported_verify_schemes()
    }
}

fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}

fn webpki_root_store() -> RootCertStore {
    RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
}

pub(crate) fn build_client_config(
    trust_policy: &TrustPolicy,
    base_host: Option<String>,
) -> crate::Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|source| tls_config_error(source.to_string()))?;

    let config = match trust_policy {
        TrustPolicy::PlatformDefault => builder
            .with_root_certificates(webpki_root_store())
            .with_no_client_auth(),
        TrustPolicy::PinnedToBaseHost => {
            let platform = platform_verifier(provider)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(BaseHostVerifier::new(
                    base_host, platform,
                )))
                .with_no_client_auth()
        }
        TrustPolicy::Custom(verifier) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(verifier))
            .with_no_client_auth(),
    };
    Ok(config)
}

fn platform_verifier(provider: Arc<CryptoProvider>) -> crate::Result<Arc<dyn ServerCertVerifier>> {
    let verifier: Arc<dyn ServerCertVerifier> =
        WebPkiServerVerifier::builder_with_provider(Arc::new(webpki_root_store()), provider)
            .build()
            .map_err(|source| tls_config_error(source.to_string()))?;
    Ok(verifier)
}
