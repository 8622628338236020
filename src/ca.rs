//! CA connector seam used by the certificate token variant.
//!
//! Signing, revocation and CRL generation happen in an external certificate
//! authority; the engine only drives the calls and aborts enrollment or
//! revocation when the connector fails.

use async_trait::async_trait;

use crate::error::Result;

/// Options forwarded to the CA when signing a request.
#[derive(Clone, Debug, Default)]
pub struct SignRequestOptions {
    /// Certificate template the CA should apply.
    pub template: Option<String>,
    /// Signed public key and challenge, for CAs that accept SPKAC requests.
    pub spkac: Option<String>,
}

/// Connector to one certificate authority.
#[async_trait]
pub trait CaConnector: Send + Sync {
    /// Human-readable connector name, stored on the token as `CA` info.
    fn name(&self) -> &str;

    /// Sign a PEM-encoded CSR and return the PEM-encoded certificate.
    async fn sign_request(&self, csr_pem: &str, options: &SignRequestOptions) -> Result<String>;

    /// Revoke the given certificate; returns the revoked serial as hex.
    async fn revoke_cert(&self, cert_pem: &str) -> Result<String>;

    /// Create a fresh CRL after revocations. `None` when the CA defers CRL
    /// publication.
    async fn create_crl(&self) -> Result<Option<String>>;
}
