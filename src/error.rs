use thiserror::Error;

/// Error taxonomy of the decision engine.
///
/// A failed OTP comparison is *not* an error: the hot "wrong password" path
/// is represented by `Option::None` / a `false` verdict. Errors abort the
/// current operation before any token or challenge state is mutated.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid required input (unknown serial, serial/user
    /// mismatch, malformed parameters). Surfaced to the caller as a client
    /// error.
    #[error("{0}")]
    Parameter(String),

    /// The public key of the certificate signing request does not equal the
    /// public key of the attestation certificate.
    #[error("certificate request does not match attestation certificate")]
    AttestationMismatch,

    /// The attestation certificate could not be verified against any
    /// configured trust anchor.
    #[error("failed to verify certificate chain of attestation certificate")]
    ChainVerification,

    /// A certificate chain must contain at least the trust root.
    #[error("can not verify certificate against an empty chain")]
    EmptyChain,

    /// A signature link in the chain (or the leaf itself) did not verify.
    #[error("certificate signature verification failed")]
    SignatureVerification,

    /// Propagated from the CA connector during signing or revocation.
    #[error("CA connector error: {0}")]
    CaConnector(String),

    /// Lower-level crypto plumbing (PEM parsing, key handling).
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a `Parameter` error from anything displayable.
    pub fn param(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
