//! Registry of the cipher suites the backend can negotiate.

use crate::tls::backend::prf::PrfHash;
use crate::tls::{CipherSuite, TlsVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    Rsa,
    DheRsa,
    EcdheRsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlg {
    HmacSha1,
    HmacSha256,
    HmacSha384,
}

#[derive(Debug)]
pub struct SuiteInfo {
    pub id: CipherSuite,
    pub name: &'static str,
    pub kx: KeyExchange,
    pub cipher: BulkCipher,
    /// None for AEAD suites.
    pub mac: Option<MacAlg>,
    pub prf: PrfHash,
    pub min_version: TlsVersion,
}

impl SuiteInfo {
    pub fn key_len(&self) -> usize {
        match self.cipher {
            BulkCipher::Aes128Cbc | BulkCipher::Aes128Gcm => 16,
            BulkCipher::Aes256Cbc | BulkCipher::Aes256Gcm => 32,
        }
    }

    pub fn mac_key_len(&self) -> usize {
        match self.mac {
            Some(MacAlg::HmacSha1) => 20,
            Some(MacAlg::HmacSha256) => 32,
            Some(MacAlg::HmacSha384) => 48,
            None => 0,
        }
    }

    pub fn mac_len(&self) -> usize {
        self.mac_key_len()
    }

    pub fn is_gcm(&self) -> bool {
        matches!(self.cipher, BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm)
    }

    /// Bytes taken from the key block per direction for the IV part:
    /// the 4-byte implicit nonce for GCM, a full block for CBC (only used
    /// as initial IV by TLS 1.0).
    pub fn fixed_iv_len(&self) -> usize {
        if self.is_gcm() {
            4
        } else {
            16
        }
    }

    pub fn usable_with(&self, version: TlsVersion) -> bool {
        version >= self.min_version
    }
}

macro_rules! suite {
    ($hi:literal, $lo:literal, $name:literal, $kx:ident, $cipher:ident, $mac:expr, $prf:ident, $min:ident) => {
        SuiteInfo {
            id: CipherSuite($hi, $lo),
            name: $name,
            kx: KeyExchange::$kx,
            cipher: BulkCipher::$cipher,
            mac: $mac,
            prf: PrfHash::$prf,
            min_version: TlsVersion::$min,
        }
    };
}

pub static SUPPORTED_SUITES: &[SuiteInfo] = &[
    suite!(0xc0, 0x2f, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", EcdheRsa, Aes128Gcm, None, Sha256, TLS1_2),
    suite!(0xc0, 0x30, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", EcdheRsa, Aes256Gcm, None, Sha384, TLS1_2),
    suite!(0xc0, 0x27, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256", EcdheRsa, Aes128Cbc, Some(MacAlg::HmacSha256), Sha256, TLS1_2),
    suite!(0xc0, 0x28, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384", EcdheRsa, Aes256Cbc, Some(MacAlg::HmacSha384), Sha384, TLS1_2),
    suite!(0xc0, 0x13, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", EcdheRsa, Aes128Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
    suite!(0xc0, 0x14, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA", EcdheRsa, Aes256Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
    suite!(0x00, 0x9e, "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256", DheRsa, Aes128Gcm, None, Sha256, TLS1_2),
    suite!(0x00, 0x9f, "TLS_DHE_RSA_WITH_AES_256_GCM_SHA384", DheRsa, Aes256Gcm, None, Sha384, TLS1_2),
    suite!(0x00, 0x67, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA256", DheRsa, Aes128Cbc, Some(MacAlg::HmacSha256), Sha256, TLS1_2),
    suite!(0x00, 0x6b, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA256", DheRsa, Aes256Cbc, Some(MacAlg::HmacSha256), Sha256, TLS1_2),
    suite!(0x00, 0x33, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA", DheRsa, Aes128Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
    suite!(0x00, 0x39, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA", DheRsa, Aes256Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
    suite!(0x00, 0x9c, "TLS_RSA_WITH_AES_128_GCM_SHA256", Rsa, Aes128Gcm, None, Sha256, TLS1_2),
    suite!(0x00, 0x9d, "TLS_RSA_WITH_AES_256_GCM_SHA384", Rsa, Aes256Gcm, None, Sha384, TLS1_2),
    suite!(0x00, 0x3c, "TLS_RSA_WITH_AES_128_CBC_SHA256", Rsa, Aes128Cbc, Some(MacAlg::HmacSha256), Sha256, TLS1_2),
    suite!(0x00, 0x3d, "TLS_RSA_WITH_AES_256_CBC_SHA256", Rsa, Aes256Cbc, Some(MacAlg::HmacSha256), Sha256, TLS1_2),
    suite!(0x00, 0x2f, "TLS_RSA_WITH_AES_128_CBC_SHA", Rsa, Aes128Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
    suite!(0x00, 0x35, "TLS_RSA_WITH_AES_256_CBC_SHA", Rsa, Aes256Cbc, Some(MacAlg::HmacSha1), Sha256, TLS1_0),
];

pub fn by_id(id: CipherSuite) -> Option<&'static SuiteInfo> {
    SUPPORTED_SUITES.iter().find(|suite| suite.id == id)
}

/// The default offer, in registry order.
pub fn default_offer() -> Vec<CipherSuite> {
    SUPPORTED_SUITES.iter().map(|suite| suite.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_wire_id() {
        let suite = by_id(CipherSuite(0xc0, 0x2f)).unwrap();
        assert_eq!(suite.name, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256");
        assert_eq!(suite.kx, KeyExchange::EcdheRsa);
        assert!(suite.is_gcm());
        assert!(by_id(CipherSuite(0x13, 0x01)).is_none());
    }

    #[test]
    fn gcm_suites_require_tls12() {
        for suite in SUPPORTED_SUITES {
            if suite.is_gcm() {
                assert!(!suite.usable_with(TlsVersion::TLS1_1));
                assert!(suite.usable_with(TlsVersion::TLS1_2));
                assert_eq!(suite.mac, None);
                assert_eq!(suite.fixed_iv_len(), 4);
            }
        }
    }

    #[test]
    fn legacy_cbc_sha_suites_cover_all_versions() {
        let suite = by_id(CipherSuite(0x00, 0x2f)).unwrap();
        assert!(suite.usable_with(TlsVersion::TLS1_0));
        assert_eq!(suite.mac_key_len(), 20);
        assert_eq!(suite.key_len(), 16);
    }
}
