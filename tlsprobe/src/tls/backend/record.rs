//! Record protection: CBC mac-then-encrypt and AES-GCM transforms.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::tls::backend::debug::DebugSink;
use crate::tls::backend::suites::{BulkCipher, MacAlg, SuiteInfo};
use crate::tls::TlsVersion;

pub const MAX_FRAGMENT_LEN: usize = 16384;
/// Upper bound on an incoming protected record body.
pub const MAX_CIPHERTEXT_LEN: usize = MAX_FRAGMENT_LEN + 2048;
pub const RECORD_HEADER_LEN: usize = 5;
pub const GCM_EXPLICIT_NONCE_LEN: usize = 8;
pub const GCM_TAG_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// One direction of record protection for one epoch.
pub struct Transform {
    suite: &'static SuiteInfo,
    version: TlsVersion,
    mac_key: Vec<u8>,
    key: Vec<u8>,
    /// Key-block IV material: CBC chaining state for TLS 1.0, the implicit
    /// nonce part for GCM.
    fixed_iv: Vec<u8>,
    /// IV observed by/used for the most recent record.
    iv: Vec<u8>,
    seq: u64,
}

fn compute_mac(
    alg: MacAlg,
    mac_key: &[u8],
    seq: u64,
    content_type: u8,
    version: TlsVersion,
    payload: &[u8],
) -> Vec<u8> {
    macro_rules! mac_with {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(mac_key).expect("hmac key");
            mac.update(&seq.to_be_bytes());
            mac.update(&[content_type, version.major, version.minor]);
            mac.update(&(payload.len() as u16).to_be_bytes());
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }};
    }
    match alg {
        MacAlg::HmacSha1 => mac_with!(Sha1),
        MacAlg::HmacSha256 => mac_with!(Sha256),
        MacAlg::HmacSha384 => mac_with!(Sha384),
    }
}

fn additional_data(seq: u64, content_type: u8, version: TlsVersion, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = content_type;
    aad[9] = version.major;
    aad[10] = version.minor;
    aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}

impl Transform {
    pub fn new(
        suite: &'static SuiteInfo,
        version: TlsVersion,
        mac_key: Vec<u8>,
        key: Vec<u8>,
        fixed_iv: Vec<u8>,
    ) -> Transform {
        let iv = fixed_iv.clone();
        Transform {
            suite,
            version,
            mac_key,
            key,
            fixed_iv,
            iv,
            seq: 0,
        }
    }

    pub fn iv_snapshot(&self) -> Vec<u8> {
        self.iv.clone()
    }

    /// Protect one record payload; returns the wire form of the body.
    pub fn encrypt(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let out = if self.suite.is_gcm() {
            self.encrypt_gcm(content_type, payload)?
        } else {
            self.encrypt_cbc(content_type, payload)?
        };
        self.seq += 1;
        Ok(out)
    }

    /// Unprotect one record body; returns the plaintext payload.
    pub fn decrypt(&mut self, content_type: u8, body: &[u8], dbg: &DebugSink) -> Result<Vec<u8>> {
        let out = if self.suite.is_gcm() {
            self.decrypt_gcm(content_type, body)?
        } else {
            self.decrypt_cbc(content_type, body, dbg)?
        };
        self.seq += 1;
        Ok(out)
    }

    fn encrypt_cbc(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let block_len = 16;
        let mac = compute_mac(
            self.suite.mac.expect("cbc suite has a mac"),
            &self.mac_key,
            self.seq,
            content_type,
            self.version,
            payload,
        );
        let mut plain = Vec::with_capacity(payload.len() + mac.len() + block_len);
        plain.extend_from_slice(payload);
        plain.extend_from_slice(&mac);
        let pad_len = block_len - (plain.len() + 1) % block_len;
        for _ in 0..=pad_len {
            plain.push(pad_len as u8);
        }
        let explicit_iv = if self.version >= TlsVersion::TLS1_1 {
            let mut iv = vec![0u8; block_len];
            rand::thread_rng().fill_bytes(&mut iv);
            self.iv = iv.clone();
            iv
        } else {
            self.iv.clone()
        };
        let ciphertext = match self.suite.cipher {
            BulkCipher::Aes128Cbc => Aes128CbcEnc::new_from_slices(&self.key, &explicit_iv)
                .map_err(|_| Error::Tls("bad CBC key material".to_string()))?
                .encrypt_padded_vec_mut::<NoPadding>(&plain),
            BulkCipher::Aes256Cbc => Aes256CbcEnc::new_from_slices(&self.key, &explicit_iv)
                .map_err(|_| Error::Tls("bad CBC key material".to_string()))?
                .encrypt_padded_vec_mut::<NoPadding>(&plain),
            _ => unreachable!("gcm handled separately"),
        };
        if self.version >= TlsVersion::TLS1_1 {
            let mut out = explicit_iv;
            out.extend_from_slice(&ciphertext);
            Ok(out)
        } else {
            // Implicit IV: the chain continues with the last cipher block.
            self.iv = ciphertext[ciphertext.len() - block_len..].to_vec();
            Ok(ciphertext)
        }
    }

    fn decrypt_cbc(&mut self, content_type: u8, body: &[u8], dbg: &DebugSink) -> Result<Vec<u8>> {
        let block_len = 16;
        let mac_len = self.suite.mac_len();
        let min_len = if self.version >= TlsVersion::TLS1_1 {
            2 * block_len
        } else {
            block_len
        };
        if body.len() < min_len || body.len() % block_len != 0 {
            return Err(Error::Tls("bad message length in CBC record".to_string()));
        }
        let (iv, ciphertext) = if self.version >= TlsVersion::TLS1_1 {
            let (iv, rest) = body.split_at(block_len);
            (iv.to_vec(), rest)
        } else {
            (self.iv.clone(), body)
        };
        let plain = match self.suite.cipher {
            BulkCipher::Aes128Cbc => Aes128CbcDec::new_from_slices(&self.key, &iv)
                .map_err(|_| Error::Tls("bad CBC key material".to_string()))?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| Error::Tls("bad record mac".to_string()))?,
            BulkCipher::Aes256Cbc => Aes256CbcDec::new_from_slices(&self.key, &iv)
                .map_err(|_| Error::Tls("bad CBC key material".to_string()))?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| Error::Tls("bad record mac".to_string()))?,
            _ => unreachable!("gcm handled separately"),
        };
        if self.version >= TlsVersion::TLS1_1 {
            self.iv = iv;
        } else {
            self.iv = ciphertext[ciphertext.len() - block_len..].to_vec();
        }
        let pad_len = *plain.last().expect("non-empty CBC plaintext") as usize;
        if plain.len() < pad_len + 1 + mac_len {
            return Err(Error::Tls("bad record mac".to_string()));
        }
        let padding_ok = plain[plain.len() - 1 - pad_len..]
            .iter()
            .all(|b| *b as usize == pad_len);
        if !padding_ok {
            return Err(Error::Tls("bad record mac".to_string()));
        }
        dbg.msg(3, &format!("padding_length: {:02x}", pad_len));
        let content_end = plain.len() - 1 - pad_len - mac_len;
        let payload = &plain[..content_end];
        let received_mac = &plain[content_end..plain.len() - 1 - pad_len];
        let expected_mac = compute_mac(
            self.suite.mac.expect("cbc suite has a mac"),
            &self.mac_key,
            self.seq,
            content_type,
            self.version,
            payload,
        );
        if received_mac.ct_eq(&expected_mac).unwrap_u8() != 1 {
            return Err(Error::Tls("bad record mac".to_string()));
        }
        Ok(payload.to_vec())
    }

    fn encrypt_gcm(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let explicit = self.seq.to_be_bytes();
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed_iv);
        nonce_bytes[4..].copy_from_slice(&explicit);
        self.iv = nonce_bytes.to_vec();
        let aad = additional_data(self.seq, content_type, self.version, payload.len());
        let nonce = Nonce::from_slice(&nonce_bytes);
        let message = Payload { msg: payload, aad: &aad };
        let ciphertext = match self.suite.cipher {
            BulkCipher::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|_| Error::Tls("bad GCM key material".to_string()))?
                .encrypt(nonce, message),
            BulkCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|_| Error::Tls("bad GCM key material".to_string()))?
                .encrypt(nonce, message),
            _ => unreachable!("cbc handled separately"),
        }
        .map_err(|_| Error::Tls("GCM encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&explicit);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_gcm(&mut self, content_type: u8, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return Err(Error::Tls("bad message length in GCM record".to_string()));
        }
        let (explicit, ciphertext) = body.split_at(GCM_EXPLICIT_NONCE_LEN);
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed_iv);
        nonce_bytes[4..].copy_from_slice(explicit);
        self.iv = nonce_bytes.to_vec();
        let plain_len = ciphertext.len() - GCM_TAG_LEN;
        let aad = additional_data(self.seq, content_type, self.version, plain_len);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let message = Payload { msg: ciphertext, aad: &aad };
        match self.suite.cipher {
            BulkCipher::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|_| Error::Tls("bad GCM key material".to_string()))?
                .decrypt(nonce, message),
            BulkCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|_| Error::Tls("bad GCM key material".to_string()))?
                .decrypt(nonce, message),
            _ => unreachable!("cbc handled separately"),
        }
        .map_err(|_| Error::Tls("bad record mac".to_string()))
    }
}

/// Build both directions of an epoch's transforms from the key block.
pub struct TransformPair {
    pub client_write: Transform,
    pub server_write: Transform,
}

pub fn derive_transforms(
    suite: &'static SuiteInfo,
    version: TlsVersion,
    key_block: &[u8],
) -> TransformPair {
    let mac_len = suite.mac_key_len();
    let key_len = suite.key_len();
    let iv_len = suite.fixed_iv_len();
    let mut offset = 0;
    let mut next = |len: usize| {
        let part = key_block[offset..offset + len].to_vec();
        offset += len;
        part
    };
    let client_mac = next(mac_len);
    let server_mac = next(mac_len);
    let client_key = next(key_len);
    let server_key = next(key_len);
    let client_iv = next(iv_len);
    let server_iv = next(iv_len);
    TransformPair {
        client_write: Transform::new(suite, version, client_mac, client_key, client_iv),
        server_write: Transform::new(suite, version, server_mac, server_key, server_iv),
    }
}

/// Total key-block bytes the suite consumes.
pub fn key_block_len(suite: &SuiteInfo) -> usize {
    2 * (suite.mac_key_len() + suite.key_len() + suite.fixed_iv_len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::backend::suites;
    use crate::tls::CipherSuite;
    use tlsprobe_tooling::logging::Logger;

    fn transform_pair(id: CipherSuite, version: TlsVersion) -> (Transform, Transform) {
        let suite = suites::by_id(id).unwrap();
        let key_block: Vec<u8> = (0..key_block_len(suite) as u32).map(|i| i as u8).collect();
        let pair = derive_transforms(suite, version, &key_block);
        (pair.client_write, pair.server_write)
    }

    fn debug_sink() -> DebugSink {
        DebugSink::new(Logger::capturing().0)
    }

    #[test]
    fn cbc_round_trip_all_versions() {
        for version in [TlsVersion::TLS1_0, TlsVersion::TLS1_1, TlsVersion::TLS1_2] {
            let (mut writer, _) = transform_pair(CipherSuite(0x00, 0x2f), version);
            let (mut reader, _) = transform_pair(CipherSuite(0x00, 0x2f), version);
            let wire = writer.encrypt(22, b"finished message bytes").unwrap();
            let plain = reader.decrypt(22, &wire, &debug_sink()).unwrap();
            assert_eq!(plain, b"finished message bytes");
        }
    }

    #[test]
    fn gcm_round_trip_and_tag_protection() {
        let (mut writer, _) = transform_pair(CipherSuite(0xc0, 0x2f), TlsVersion::TLS1_2);
        let (mut reader, _) = transform_pair(CipherSuite(0xc0, 0x2f), TlsVersion::TLS1_2);
        let mut wire = writer.encrypt(23, b"application payload").unwrap();
        // Flipping a ciphertext bit must fail authentication.
        let mut tampered_reader = {
            let (reader, _) = transform_pair(CipherSuite(0xc0, 0x2f), TlsVersion::TLS1_2);
            reader
        };
        let mut tampered = wire.clone();
        tampered[GCM_EXPLICIT_NONCE_LEN] ^= 0x01;
        assert!(tampered_reader.decrypt(23, &tampered, &debug_sink()).is_err());
        let plain = reader.decrypt(23, &wire, &debug_sink()).unwrap();
        assert_eq!(plain, b"application payload");
        // A replay under the next sequence number must fail as well.
        wire = writer.encrypt(23, b"application payload").unwrap();
        let plain = reader.decrypt(23, &wire, &debug_sink()).unwrap();
        assert_eq!(plain, b"application payload");
    }

    #[test]
    fn cbc_mac_covers_the_sequence_number() {
        let (mut writer, _) = transform_pair(CipherSuite(0x00, 0x2f), TlsVersion::TLS1_2);
        let (mut reader, _) = transform_pair(CipherSuite(0x00, 0x2f), TlsVersion::TLS1_2);
        let first = writer.encrypt(22, b"abc").unwrap();
        let _ = reader.decrypt(22, &first, &debug_sink()).unwrap();
        // Replaying the same record under seq 1 fails the MAC check.
        assert!(reader.decrypt(22, &first, &debug_sink()).is_err());
    }

    #[test]
    fn cbc_decrypt_reports_padding_length() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(tlsprobe_tooling::logging::LogLevel::Low);
        let dbg = DebugSink::new(logger);
        let (mut writer, _) = transform_pair(CipherSuite(0x00, 0x2f), TlsVersion::TLS1_2);
        let (mut reader, _) = transform_pair(CipherSuite(0x00, 0x2f), TlsVersion::TLS1_2);
        let wire = writer.encrypt(22, &[0u8; 11]).unwrap();
        reader.decrypt(22, &wire, &dbg).unwrap();
        assert!(trace
            .messages()
            .iter()
            .any(|m| m.starts_with("padding_length: ")));
    }

    #[test]
    fn key_block_partitioning_is_symmetric() {
        let suite = suites::by_id(CipherSuite(0xc0, 0x30)).unwrap();
        // SHA384 GCM: no MAC keys, 32-byte keys, 4-byte fixed IVs.
        assert_eq!(key_block_len(suite), 2 * (0 + 32 + 4));
        let suite = suites::by_id(CipherSuite(0x00, 0x35)).unwrap();
        assert_eq!(key_block_len(suite), 2 * (20 + 32 + 16));
    }
}
