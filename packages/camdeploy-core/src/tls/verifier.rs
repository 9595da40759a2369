//! rustls verifier that replaces CA validation with the pin store.

use super::{CertificateStore, PinOutcome, PinPolicy, fingerprint};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use std::sync::Arc;
use std::time::SystemTime;

/// Prefix of the rustls error raised when an enforced pin rejects a handshake.
/// The transport looks for it to classify the failure.
pub const PIN_REJECTED_MARKER: &str = "certificate pin mismatch";

pub struct PinningVerifier {
    store: Arc<CertificateStore>,
    policy: PinPolicy,
}

impl PinningVerifier {
    pub fn new(store: Arc<CertificateStore>, policy: PinPolicy) -> Self {
        Self { store, policy }
    }

    fn host_of(server_name: &ServerName) -> String {
        match server_name {
            ServerName::DnsName(name) => name.as_ref().to_string(),
            ServerName::IpAddress(ip) => ip.to_string(),
            other => format!("{:?}", other),
        }
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = Self::host_of(server_name);
        let presented = fingerprint(&end_entity.0);

        match self.store.check(&host, &presented) {
            PinOutcome::Pinned => {
                tracing::info!("Pinned certificate for {} ({})", host, presented);
            }
            PinOutcome::Matched => {
                tracing::debug!("Certificate for {} matches pin", host);
            }
            PinOutcome::Mismatch { stored, presented } => {
                tracing::warn!(
                    target: "security",
                    host = %host,
                    stored = %stored,
                    presented = %presented,
                    policy = %self.policy,
                    "Certificate fingerprint changed since first contact"
                );
                if self.policy == PinPolicy::Enforce {
                    return Err(rustls::Error::General(format!(
                        "{} for {}",
                        PIN_REJECTED_MARKER, host
                    )));
                }
            }
        }

        Ok(ServerCertVerified::assertion())
    }
}

/// rustls client configuration that pins device certificates.
pub fn pinned_client_config(store: Arc<CertificateStore>, policy: PinPolicy) -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PinningVerifier::new(store, policy)))
        .with_no_client_auth()
}
