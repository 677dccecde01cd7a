//! Signatures over ServerKeyExchange parameters and CertificateVerify.

use md5::Md5;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::error::{Error, Result};
use crate::tls::TlsVersion;

pub const HASH_SHA1: u8 = 2;
pub const HASH_SHA256: u8 = 4;
pub const HASH_SHA384: u8 = 5;
pub const SIG_RSA: u8 = 1;

fn md5_sha1(parts: &[&[u8]]) -> Vec<u8> {
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    for part in parts {
        md5.update(part);
        sha1.update(part);
    }
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(&md5.finalize());
    out.extend_from_slice(&sha1.finalize());
    out
}

fn hash_parts(hash: u8, parts: &[&[u8]]) -> Result<Vec<u8>> {
    macro_rules! digest_with {
        ($digest:ty) => {{
            let mut digest = <$digest>::new();
            for part in parts {
                digest.update(part);
            }
            digest.finalize().to_vec()
        }};
    }
    match hash {
        HASH_SHA1 => Ok(digest_with!(Sha1)),
        HASH_SHA256 => Ok(digest_with!(Sha256)),
        HASH_SHA384 => Ok(digest_with!(Sha384)),
        other => Err(Error::Tls(format!("unsupported hash algorithm {}", other))),
    }
}

fn padding_for(hash: u8) -> Result<Pkcs1v15Sign> {
    match hash {
        HASH_SHA1 => Ok(Pkcs1v15Sign::new::<Sha1>()),
        HASH_SHA256 => Ok(Pkcs1v15Sign::new::<Sha256>()),
        HASH_SHA384 => Ok(Pkcs1v15Sign::new::<Sha384>()),
        other => Err(Error::Tls(format!("unsupported hash algorithm {}", other))),
    }
}

/// Sign ServerKeyExchange parameters. For TLS 1.2 the signature uses
/// SHA-256 and the returned pair announces it; earlier versions use the
/// unprefixed MD5+SHA-1 construction.
pub fn sign_server_params(
    version: TlsVersion,
    key: &RsaPrivateKey,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Result<(Option<(u8, u8)>, Vec<u8>)> {
    if version >= TlsVersion::TLS1_2 {
        let digest = hash_parts(HASH_SHA256, &[client_random, server_random, params])?;
        let signature = key
            .sign(padding_for(HASH_SHA256)?, &digest)
            .map_err(|e| Error::Tls(format!("signing key exchange failed: {}", e)))?;
        Ok((Some((HASH_SHA256, SIG_RSA)), signature))
    } else {
        let digest = md5_sha1(&[client_random, server_random, params]);
        let signature = key
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
            .map_err(|e| Error::Tls(format!("signing key exchange failed: {}", e)))?;
        Ok((None, signature))
    }
}

/// Verify a received ServerKeyExchange signature. `algorithm` is the
/// `(hash, signature)` pair for TLS 1.2, absent before.
pub fn verify_server_params(
    key: &RsaPublicKey,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
    algorithm: Option<(u8, u8)>,
    signature: &[u8],
) -> Result<()> {
    match algorithm {
        Some((hash, sig)) => {
            if sig != SIG_RSA {
                return Err(Error::Tls(format!("unsupported signature algorithm {}", sig)));
            }
            let digest = hash_parts(hash, &[client_random, server_random, params])?;
            key.verify(padding_for(hash)?, &digest, signature)
                .map_err(|_| Error::Tls("key exchange signature verification failed".to_string()))
        }
        None => {
            let digest = md5_sha1(&[client_random, server_random, params]);
            key.verify(Pkcs1v15Sign::new_unprefixed(), &digest, signature)
                .map_err(|_| Error::Tls("key exchange signature verification failed".to_string()))
        }
    }
}

/// CertificateVerify signature over the handshake transcript digest.
pub fn sign_transcript_digest(
    version: TlsVersion,
    key: &RsaPrivateKey,
    digest: &[u8],
) -> Result<Vec<u8>> {
    let padding = if version >= TlsVersion::TLS1_2 {
        padding_for(HASH_SHA256)?
    } else {
        Pkcs1v15Sign::new_unprefixed()
    };
    key.sign(padding, digest)
        .map_err(|e| Error::Tls(format!("signing certificate verify failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn tls12_server_params_signature_verifies() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&key);
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let params = b"ecdhe params";
        let (algorithm, signature) =
            sign_server_params(TlsVersion::TLS1_2, &key, &cr, &sr, params).unwrap();
        assert_eq!(algorithm, Some((HASH_SHA256, SIG_RSA)));
        verify_server_params(&public, &cr, &sr, params, algorithm, &signature).unwrap();
        // Mutated params must not verify.
        assert!(
            verify_server_params(&public, &cr, &sr, b"ecdhe paramsX", algorithm, &signature)
                .is_err()
        );
    }

    #[test]
    fn legacy_md5_sha1_signature_verifies() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&key);
        let cr = [3u8; 32];
        let sr = [4u8; 32];
        let params = b"dh params";
        let (algorithm, signature) =
            sign_server_params(TlsVersion::TLS1_0, &key, &cr, &sr, params).unwrap();
        assert_eq!(algorithm, None);
        verify_server_params(&public, &cr, &sr, params, None, &signature).unwrap();
    }
}
