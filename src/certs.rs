//! Certificate trust-chain verification engine.
//!
//! Validates device attestation certificates against administrator-provided
//! trust anchors before a certificate token may be enrolled. A chain file
//! lists PEM certificates from the trusted root down to the last
//! intermediate; the attestation certificate itself arrives separately and
//! must verify against the end of the chain.
//!
//! Verification is all-or-nothing: one broken signature link fails the whole
//! chain. Scanning the configured trust directories is lenient the other way
//! around — a chain file that fails to parse or verify is logged and
//! skipped, and only total failure across every file of every directory is
//! reported to the caller.

use openssl::pkey::{PKey, Public};
use openssl::x509::{X509, X509Req};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Split chain-file text into its PEM certificate blocks, root first.
///
/// Blank lines and lines starting with `#` are ignored. A `BEGIN` block
/// that is never closed by an `END` marker is silently dropped; a truncated
/// file can only ever shrink the set of anchors that verify, so leniency
/// here cannot widen trust.
#[must_use]
pub fn parse_chain(text: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.starts_with(PEM_BEGIN) {
            current = Some(format!("{line}\n"));
        } else if line.starts_with(PEM_END) {
            if let Some(mut cert) = current.take() {
                cert.push_str(line);
                cert.push('\n');
                certs.push(cert);
            }
        } else if line.trim().is_empty() || line.starts_with('#') {
            // comment or spacing between blocks
        } else if let Some(cert) = current.as_mut() {
            cert.push_str(line);
            cert.push('\n');
        }
    }
    certs
}

/// Parse a chain file into an ordered list of PEM certificates, the trusted
/// root being the first entry.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn parse_chain_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_chain(&text))
}

fn signed_by(child: &X509, issuer_key: &PKey<Public>) -> Result<()> {
    if child.verify(issuer_key)? {
        Ok(())
    } else {
        Err(Error::SignatureVerification)
    }
}

/// Verify `certificate` against a chain of any length, ordered root →
/// intermediates.
///
/// Each certificate must carry a signature by its predecessor's public key
/// (PKCS#1 v1.5, hash algorithm taken from the certificate itself); finally
/// the certificate under test must verify against the last chain element.
///
/// # Errors
/// `Error::EmptyChain` for an empty chain, `Error::SignatureVerification`
/// when any link fails, `Error::Crypto` when a PEM block does not parse.
pub fn verify_certificate(certificate: &str, chain: &[String]) -> Result<()> {
    let Some((root, intermediates)) = chain.split_first() else {
        return Err(Error::EmptyChain);
    };
    let mut anchor = X509::from_pem(root.as_bytes())?;
    for pem in intermediates {
        let next = X509::from_pem(pem.as_bytes())?;
        signed_by(&next, &anchor.public_key()?)?;
        anchor = next;
    }
    let leaf = X509::from_pem(certificate.as_bytes())?;
    signed_by(&leaf, &anchor.public_key()?)
}

/// Try to verify `certificate` against every chain file in every configured
/// trust directory; `true` on the first chain that verifies.
///
/// A directory that does not exist is a misconfiguration warning, not a
/// fatal error. Per-file parse or verification failures are logged at debug
/// level and skipped.
#[must_use]
pub fn verify_certificate_path(certificate: &str, trusted_ca_paths: &[impl AsRef<Path>]) -> bool {
    for ca_path in trusted_ca_paths {
        let ca_path = ca_path.as_ref();
        if !ca_path.is_dir() {
            warn!(
                path = %ca_path.display(),
                "the configured attestation CA directory does not exist"
            );
            continue;
        }
        let Ok(entries) = fs::read_dir(ca_path) else {
            warn!(path = %ca_path.display(), "cannot list attestation CA directory");
            continue;
        };
        let mut files: Vec<_> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        for file in files {
            match parse_chain_file(&file) {
                Ok(chain) => match verify_certificate(certificate, &chain) {
                    Ok(()) => return true,
                    Err(err) => {
                        debug!(
                            chainfile = %file.display(),
                            "can not verify attestation certificate against chain: {err}"
                        );
                    }
                },
                Err(err) => {
                    debug!(chainfile = %file.display(), "unreadable chain file: {err}");
                }
            }
        }
    }
    false
}

/// Check that a certificate signing request carries a valid self-signature.
///
/// # Errors
/// Returns an error if the CSR does not parse.
pub fn csr_signature_valid(csr_pem: &str) -> Result<bool> {
    let csr = X509Req::from_pem(csr_pem.as_bytes())?;
    let key = csr.public_key()?;
    Ok(csr.verify(&key)?)
}

/// Compare the public key of a CSR with the public key embedded in an
/// attestation certificate. Both must be exactly equal for the attestation
/// to vouch for the request.
///
/// # Errors
/// Returns an error if either PEM does not parse.
pub fn csr_matches_attestation(csr_pem: &str, attestation_pem: &str) -> Result<bool> {
    let csr = X509Req::from_pem(csr_pem.as_bytes())?;
    let attestation = X509::from_pem(attestation_pem.as_bytes())?;
    let attested_key = attestation.public_key()?;
    Ok(csr.public_key()?.public_eq(&attested_key))
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::test_certs::{csr, csr_pem, identity, issue, keypair, pem};
    use super::*;
    use std::fs;
    use uuid::Uuid;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("validi-certs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parse_chain_keeps_file_order() {
        let root = identity("Test Root CA", None);
        let intermediate = identity("Test Intermediate", Some(&root));
        let root_pem = pem(&root.cert);
        let inter_pem = pem(&intermediate.cert);
        let text = format!("# trusted attestation chain\n\n{root_pem}\n{inter_pem}");

        let chain = parse_chain(&text);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].trim(), root_pem.trim());
        assert_eq!(chain[1].trim(), inter_pem.trim());
    }

    #[test]
    fn parse_chain_drops_unclosed_block() {
        let root = identity("Test Root CA", None);
        let root_pem = pem(&root.cert);
        // second block loses its END marker
        let truncated = root_pem.replace("-----END CERTIFICATE-----", "");
        let text = format!("{root_pem}{truncated}");
        let chain = parse_chain(&text);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn parse_chain_file_round_trip() {
        let root = identity("Test Root CA", None);
        let dir = temp_dir();
        let file = dir.join("chain.pem");
        fs::write(&file, pem(&root.cert)).unwrap();
        let chain = parse_chain_file(&file).unwrap();
        assert_eq!(chain.len(), 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn verify_against_empty_chain_fails_closed() {
        let root = identity("Test Root CA", None);
        let err = verify_certificate(&pem(&root.cert), &[]).unwrap_err();
        assert!(matches!(err, Error::EmptyChain));
    }

    #[test]
    fn verify_full_chain() {
        let root = identity("Test Root CA", None);
        let intermediate = identity("Test Intermediate", Some(&root));
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&intermediate));

        let chain = vec![pem(&root.cert), pem(&intermediate.cert)];
        verify_certificate(&pem(&leaf), &chain).unwrap();
    }

    #[test]
    fn verify_single_element_chain() {
        let root = identity("Test Root CA", None);
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&root));
        verify_certificate(&pem(&leaf), &[pem(&root.cert)]).unwrap();
    }

    #[test]
    fn broken_intermediate_link_fails() {
        let root = identity("Test Root CA", None);
        let other_root = identity("Unrelated CA", None);
        // intermediate signed by a different root than the chain claims
        let intermediate = identity("Test Intermediate", Some(&other_root));
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&intermediate));

        let chain = vec![pem(&root.cert), pem(&intermediate.cert)];
        let err = verify_certificate(&pem(&leaf), &chain).unwrap_err();
        assert!(matches!(err, Error::SignatureVerification));
    }

    #[test]
    fn leaf_from_wrong_issuer_fails() {
        let root = identity("Test Root CA", None);
        let other_root = identity("Unrelated CA", None);
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&other_root));
        let err = verify_certificate(&pem(&leaf), &[pem(&root.cert)]).unwrap_err();
        assert!(matches!(err, Error::SignatureVerification));
    }

    #[test]
    fn path_lookup_skips_bad_files_and_missing_dirs() {
        let root = identity("Test Root CA", None);
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&root));

        let dir = temp_dir();
        fs::write(dir.join("00-garbage.pem"), "not a chain at all").unwrap();
        fs::write(dir.join("10-good.pem"), pem(&root.cert)).unwrap();

        let missing = std::env::temp_dir().join(format!("validi-missing-{}", Uuid::new_v4()));
        let paths = vec![missing, dir.clone()];
        assert!(verify_certificate_path(&pem(&leaf), &paths));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn path_lookup_reports_total_failure() {
        let root = identity("Test Root CA", None);
        let stranger = identity("Unrelated CA", None);
        let leaf_key = keypair();
        let leaf = issue("Test Device", &leaf_key, Some(&stranger));

        let dir = temp_dir();
        fs::write(dir.join("chain.pem"), pem(&root.cert)).unwrap();
        assert!(!verify_certificate_path(&pem(&leaf), &[dir.clone()]));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn csr_key_comparison() {
        let device_key = keypair();
        let request = csr("device", &device_key);
        let attestation = issue("device attestation", &device_key, None);
        assert!(csr_matches_attestation(&csr_pem(&request), &pem(&attestation)).unwrap());

        let other_key = keypair();
        let wrong_attestation = issue("device attestation", &other_key, None);
        assert!(!csr_matches_attestation(&csr_pem(&request), &pem(&wrong_attestation)).unwrap());
    }

    #[test]
    fn csr_self_signature() {
        let key = keypair();
        let request = csr("device", &key);
        assert!(csr_signature_valid(&csr_pem(&request)).unwrap());
    }
}
