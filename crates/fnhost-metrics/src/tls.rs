// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Certificate trust policy for the metrics endpoint.
//!
//! Control-plane endpoints are sometimes addressed by a name their
//! certificate does not carry. The policy therefore tolerates exactly one
//! failure: a host name mismatch on a certificate whose chain can be
//! rebuilt to a trusted root. Every other failure rejects the connection.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_cert_signed_by_trust_anchor, verify_server_name};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{error, warn};

use crate::error::CertificateValidationError;

/// Failures reported by the standard validation of a server certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyErrors {
    /// The certificate is not valid for the requested name.
    pub name_mismatch: Option<String>,
    /// The chain does not lead to a trusted root.
    pub chain: Option<String>,
}

impl PolicyErrors {
    /// No failure at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether standard validation passed.
    pub fn is_empty(&self) -> bool {
        self.name_mismatch.is_none() && self.chain.is_none()
    }
}

/// Decide whether to trust a server certificate.
///
/// `rebuild_chain` is only invoked when the name mismatch is the sole
/// failure.
pub fn evaluate_trust<F>(errors: &PolicyErrors, rebuild_chain: F) -> Result<(), CertificateValidationError>
where
    F: FnOnce() -> Result<(), String>,
{
    match (&errors.name_mismatch, &errors.chain) {
        (None, None) => Ok(()),
        (Some(mismatch), None) => match rebuild_chain() {
            Ok(()) => {
                warn!(detail = %mismatch, "Accepting certificate with host name mismatch after chain rebuild");
                Ok(())
            }
            Err(status) => Err(CertificateValidationError::RebuildFailed { status }),
        },
        (_, Some(status)) => Err(CertificateValidationError::Chain {
            status: status.clone(),
        }),
    }
}

/// rustls verifier applying [`evaluate_trust`].
pub struct MetricsCertVerifier {
    roots: Arc<RootCertStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl MetricsCertVerifier {
    /// Verifier trusting `roots`, verifying signatures with `provider`.
    pub fn new(roots: Arc<RootCertStore>, provider: &CryptoProvider) -> Self {
        Self {
            roots,
            algorithms: provider.signature_verification_algorithms,
        }
    }

    fn check_chain(
        &self,
        cert: &ParsedCertificate<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), String> {
        verify_server_cert_signed_by_trust_anchor(cert, &self.roots, intermediates, now, self.algorithms.all)
            .map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for MetricsCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCertVerifier")
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl ServerCertVerifier for MetricsCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity).map_err(|e| {
            let err = CertificateValidationError::Unparseable(e.to_string());
            error!(server_name = ?server_name, error = %err, "Rejecting metrics endpoint certificate");
            e
        })?;

        let errors = PolicyErrors {
            name_mismatch: verify_server_name(&cert, server_name).err().map(|e| e.to_string()),
            chain: self.check_chain(&cert, intermediates, now).err(),
        };

        evaluate_trust(&errors, || self.check_chain(&cert, intermediates, now))
            .map(|()| ServerCertVerified::assertion())
            .map_err(|err| {
                error!(
                    server_name = ?server_name,
                    error = %err,
                    "Failed to validate metrics endpoint certificate"
                );
                rustls::Error::General(err.to_string())
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Root store with the Mozilla trust anchors.
pub fn default_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Client configuration using [`MetricsCertVerifier`] over `roots`.
pub fn client_config(roots: RootCertStore) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(MetricsCertVerifier::new(Arc::new(roots), &provider));
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}
