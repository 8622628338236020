//! X.509 certificate token.
//!
//! Enrollment either uploads a finished certificate, signs a client CSR via
//! the configured CA connector, or generates the key pair server-side. A
//! CSR may be accompanied by a device attestation certificate; the request
//! is only forwarded to the CA after the attestation public key matches the
//! CSR and the attestation chain verifies against the trusted anchors.
//!
//! The token never authenticates; its value is the issued certificate (and,
//! for server-side keys, the PKCS#12 container derived from it).

use base64ct::{Base64, Encoding};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509Req, X509ReqBuilder, X509};
use std::path::PathBuf;
use tracing::info;

use crate::ca::{CaConnector, SignRequestOptions};
use crate::certs::{csr_matches_attestation, csr_signature_valid, verify_certificate_path};
use crate::error::{Error, Result};
use crate::token::{CheckContext, ClassInfo, InitParams, TokenData, TokenVariant};

const DEFAULT_KEY_SIZE: u32 = 2048;

pub struct CertificateToken;

impl CertificateToken {
    /// Complete an enrollment: resolve the certificate from the parameters
    /// and store it (plus key material) on the token.
    ///
    /// # Errors
    /// `Error::Parameter` for an unusable parameter set,
    /// `Error::AttestationMismatch` / `Error::ChainVerification` when the
    /// attestation does not vouch for the request, and CA connector errors
    /// when signing fails.
    pub async fn enroll(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        ca: Option<&dyn CaConnector>,
        trusted_ca_paths: &[PathBuf],
        ctx: &CheckContext<'_>,
    ) -> Result<()> {
        data.otp_len = 0;
        if let Some(pin) = &params.pin {
            data.set_pin(pin, false);
        }
        if let Some(template) = &params.template {
            data.set_info("template", template);
        }

        if let Some(certificate) = &params.certificate {
            // upload of a finished certificate, no CA involved
            X509::from_pem(certificate.as_bytes())?;
            data.set_info("certificate", certificate);
            return Ok(());
        }

        let ca = ca.ok_or_else(|| Error::param("Missing CA connector for certificate token"))?;

        let csr_pem = if let Some(request) = &params.request {
            if !csr_signature_valid(request)? {
                return Err(Error::param("request has invalid signature"));
            }
            if let Some(attestation) = &params.attestation {
                self.verify_attestation(request, attestation, trusted_ca_paths, ctx)?;
            }
            request.clone()
        } else if params.gen_key {
            self.generate_request(data, params)?
        } else {
            return Err(Error::param(
                "Missing attribute: request, certificate or genkey",
            ));
        };

        let options = SignRequestOptions {
            template: params.template.clone(),
            spkac: None,
        };
        let certificate = ca.sign_request(&csr_pem, &options).await?;
        data.set_info("certificate", certificate);
        data.set_info("CA", ca.name());
        info!(serial = data.serial(), ca = ca.name(), "issued certificate for token");
        Ok(())
    }

    fn verify_attestation(
        &self,
        request: &str,
        attestation: &str,
        trusted_ca_paths: &[PathBuf],
        ctx: &CheckContext<'_>,
    ) -> Result<()> {
        if !csr_matches_attestation(request, attestation)? {
            return Err(Error::AttestationMismatch);
        }
        if ctx.config.verify_attestation_chain()
            && !verify_certificate_path(attestation, trusted_ca_paths)
        {
            return Err(Error::ChainVerification);
        }
        Ok(())
    }

    /// Server-side key generation: create the key pair, keep the private
    /// key on the token (flagged for encrypted storage) and return a CSR
    /// for it.
    fn generate_request(&self, data: &mut TokenData, params: &InitParams) -> Result<String> {
        let bits = params.key_size.unwrap_or(DEFAULT_KEY_SIZE);
        let rsa = Rsa::generate(bits)?;
        let key = PKey::from_rsa(rsa)?;

        let subject = data
            .owner
            .as_ref()
            .map_or_else(|| data.serial().to_string(), |owner| owner.login.clone());
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", &subject)?;
        let name = name.build();

        let mut builder = X509ReqBuilder::new()?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.sign(&key, MessageDigest::sha256())?;
        let csr = builder.build();

        let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8()?)
            .map_err(|_| Error::param("generated key is not valid UTF-8"))?;
        data.set_info_password("privatekey", key_pem);

        String::from_utf8(csr.to_pem()?).map_err(|_| Error::param("CSR is not valid UTF-8"))
    }

    /// Base64-encoded PKCS#12 container of certificate and private key.
    /// `None` when the token has no server-side key material.
    ///
    /// # Errors
    /// Returns an error when the stored PEM data does not parse.
    pub fn pkcs12_base64(&self, data: &TokenData, passphrase: &str) -> Result<Option<String>> {
        let Some(key_pem) = data.info_value("privatekey") else {
            return Ok(None);
        };
        let certificate = data
            .info_value("certificate")
            .ok_or_else(|| Error::param("Token has no certificate"))?;
        let cert = X509::from_pem(certificate.as_bytes())?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())?;
        let pkcs12 = Pkcs12::builder()
            .name(data.serial())
            .pkey(&key)
            .cert(&cert)
            .build2(passphrase)?;
        Ok(Some(Base64::encode_string(&pkcs12.to_der()?)))
    }

    /// Revoke the issued certificate at the CA and refresh the CRL, then
    /// mark the token revoked.
    ///
    /// # Errors
    /// CA connector errors abort before the token is touched.
    pub async fn revoke_via_ca(
        &self,
        data: &mut TokenData,
        ca: &dyn CaConnector,
    ) -> Result<()> {
        let certificate = data
            .info_value("certificate")
            .ok_or_else(|| Error::param("Token has no certificate"))?
            .to_string();
        let revoked = ca.revoke_cert(&certificate).await?;
        let crl = ca.create_crl().await?;
        info!(
            serial = data.serial(),
            revoked = %revoked,
            crl = crl.as_deref().unwrap_or(""),
            "revoked certificate"
        );
        data.revoked = true;
        data.active = false;
        Ok(())
    }

    /// The CSR embedded in the last enrollment, parsed. Mostly useful to
    /// callers inspecting a pending request.
    ///
    /// # Errors
    /// Returns an error when the PEM does not parse.
    pub fn parse_request(&self, pem: &str) -> Result<X509Req> {
        Ok(X509Req::from_pem(pem.as_bytes())?)
    }
}

impl TokenVariant for CertificateToken {
    fn token_type(&self) -> &'static str {
        "certificate"
    }

    fn serial_prefix(&self) -> &'static str {
        "CRT"
    }

    fn class_info(&self) -> ClassInfo {
        ClassInfo {
            token_type: "certificate",
            title: "Certificate Token",
            description: "Enrolls an X.509 certificate, optionally attested by device hardware.",
            policy_actions: &[
                crate::policy::ACTION_TRUSTED_CA_PATH,
                crate::policy::ACTION_REQUIRE_ATTESTATION,
            ],
        }
    }

    fn update(
        &self,
        data: &mut TokenData,
        params: &InitParams,
        _ctx: &CheckContext<'_>,
    ) -> Result<()> {
        // The async part of enrollment happens in `enroll`; this only
        // applies the synchronous bits for edits.
        data.otp_len = 0;
        if let Some(pin) = &params.pin {
            data.set_pin(pin, false);
        }
        Ok(())
    }

    /// Certificates never take part in OTP authentication.
    fn check_otp(
        &self,
        _data: &mut TokenData,
        _otp: &str,
        _counter: Option<u64>,
        _ctx: &CheckContext<'_>,
    ) -> Option<u64> {
        None
    }

    fn get_otp(&self, _data: &TokenData, _current_time: Option<f64>) -> Result<String> {
        Err(Error::param("Certificate tokens have no OTP values"))
    }

    fn get_multi_otp(
        &self,
        _data: &TokenData,
        _count: usize,
        _current_time: Option<f64>,
    ) -> Result<std::collections::BTreeMap<u64, String>> {
        Err(Error::param("Certificate tokens have no OTP values"))
    }
}
