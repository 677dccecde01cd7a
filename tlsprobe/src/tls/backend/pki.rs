//! Certificate and private-key material: PEM/DER loading and extraction of
//! the peer's RSA public key from a received Certificate message.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use x509_parser::prelude::*;

use crate::error::{Error, Result};

/// The certificate chain and private key this endpoint presents.
pub struct Identity {
    pub certificate_chain: Vec<Vec<u8>>,
    pub private_key: RsaPrivateKey,
}

impl Identity {
    pub fn from_files_content(certificate: &[u8], private_key: &[u8]) -> Result<Identity> {
        let certificate_chain = parse_certificates(certificate)?;
        if certificate_chain.is_empty() {
            return Err(Error::Configuration(
                "certificate file contains no certificate".to_string(),
            ));
        }
        let private_key = parse_private_key(private_key)?;
        Ok(Identity {
            certificate_chain,
            private_key,
        })
    }
}

/// Accepts one or more PEM `CERTIFICATE` blocks, or a single DER certificate.
pub fn parse_certificates(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    if let Ok(blocks) = ::pem::parse_many(data) {
        let chain: Vec<Vec<u8>> = blocks
            .iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.contents().to_vec())
            .collect();
        if !chain.is_empty() {
            return Ok(chain);
        }
    }
    // Not PEM; require a parseable DER certificate.
    parse_x509_certificate(data)
        .map_err(|e| Error::Configuration(format!("parsing certificate failed: {}", e)))?;
    Ok(vec![data.to_vec()])
}

/// Accepts PKCS#8 (`PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`) in PEM or DER.
pub fn parse_private_key(data: &[u8]) -> Result<RsaPrivateKey> {
    if let Ok(blocks) = ::pem::parse_many(data) {
        for block in &blocks {
            match block.tag() {
                "PRIVATE KEY" => {
                    return RsaPrivateKey::from_pkcs8_der(block.contents())
                        .map_err(|e| Error::Configuration(format!("parsing private key failed: {}", e)));
                }
                "RSA PRIVATE KEY" => {
                    return RsaPrivateKey::from_pkcs1_der(block.contents())
                        .map_err(|e| Error::Configuration(format!("parsing private key failed: {}", e)));
                }
                _ => continue,
            }
        }
    }
    RsaPrivateKey::from_pkcs8_der(data)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(data))
        .map_err(|e| Error::Configuration(format!("parsing private key failed: {}", e)))
}

/// RSA public key of the leaf certificate in a received chain.
pub fn rsa_public_key_from_certificate(der: &[u8]) -> Result<RsaPublicKey> {
    let (_, certificate) = parse_x509_certificate(der)
        .map_err(|e| Error::Tls(format!("parsing peer certificate failed: {}", e)))?;
    let spki = &certificate.tbs_certificate.subject_pki;
    let key_bytes: &[u8] = &spki.subject_public_key.data;
    RsaPublicKey::from_pkcs1_der(key_bytes)
        .or_else(|_| RsaPublicKey::from_public_key_der(spki.raw))
        .map_err(|_| Error::Tls("peer certificate does not carry an RSA key".to_string()))
}
