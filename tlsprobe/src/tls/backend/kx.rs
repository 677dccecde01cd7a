//! Key-exchange arithmetic: RSA key transport with hand-built
//! RSAES-PKCS1-v1_5 padding (the manipulation knobs live here), ephemeral
//! Diffie-Hellman, and ECDHE over P-256.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::hazmat::{rsa_decrypt_and_check, rsa_encrypt};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

use crate::error::{Error, Result};

/// Override values for the three structural bytes of an
/// RSAES-PKCS1-v1_5 encryption block. The correct values are
/// `0x00 | 0x02 | PS | 0x00 | M`.
#[derive(Debug, Clone, Copy)]
pub struct Pkcs1Overrides {
    pub enabled: bool,
    pub first_byte: u8,
    pub block_type: u8,
    pub padding: u8,
}

impl Default for Pkcs1Overrides {
    fn default() -> Self {
        Pkcs1Overrides {
            enabled: false,
            first_byte: 0x00,
            block_type: 0x02,
            padding: 0x00,
        }
    }
}

/// Individually skippable receive-side checks of the same block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pkcs1SkipChecks {
    pub first_byte: bool,
    pub block_type: bool,
    pub delimiter: bool,
    pub pms_version: bool,
}

/// Which structural check a received block failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pkcs1Violation {
    FirstByte,
    BlockType,
    Delimiter,
    ShortPadding,
}

/// RSAES-PKCS1-v1_5 encryption with override hooks.
pub fn rsaes_pkcs1_v15_encrypt(
    key: &RsaPublicKey,
    message: &[u8],
    overrides: &Pkcs1Overrides,
) -> Result<Vec<u8>> {
    let k = key.size();
    if message.len() + 11 > k {
        return Err(Error::Tls("message too long for RSA key".to_string()));
    }
    let mut em = vec![0u8; k];
    em[0] = if overrides.enabled { overrides.first_byte } else { 0x00 };
    em[1] = if overrides.enabled { overrides.block_type } else { 0x02 };
    let ps_len = k - 3 - message.len();
    let mut rng = OsRng;
    for slot in em[2..2 + ps_len].iter_mut() {
        let mut byte = [0u8];
        loop {
            rng.fill_bytes(&mut byte);
            if byte[0] != 0 {
                break;
            }
        }
        *slot = byte[0];
    }
    em[2 + ps_len] = if overrides.enabled { overrides.padding } else { 0x00 };
    em[3 + ps_len..].copy_from_slice(message);
    let m = BigUint::from_bytes_be(&em);
    let c = rsa_encrypt(key, &m).map_err(|e| Error::Tls(format!("RSA encryption failed: {}", e)))?;
    Ok(left_pad(&c.to_bytes_be(), k))
}

/// RSAES-PKCS1-v1_5 decryption with skippable checks. On success returns the
/// embedded message. `expected_len` bounds the fallback message extraction
/// when the delimiter check is skipped and no delimiter exists.
pub fn rsaes_pkcs1_v15_decrypt(
    key: &RsaPrivateKey,
    ciphertext: &[u8],
    expected_len: usize,
    skip: &Pkcs1SkipChecks,
) -> std::result::Result<Vec<u8>, Pkcs1Violation> {
    let k = key.size();
    let c = BigUint::from_bytes_be(ciphertext);
    let m = rsa_decrypt_and_check::<OsRng>(key, None, &c).map_err(|_| Pkcs1Violation::FirstByte)?;
    let em = left_pad(&m.to_bytes_be(), k);
    if em[0] != 0x00 && !skip.first_byte {
        return Err(Pkcs1Violation::FirstByte);
    }
    if em[1] != 0x02 && !skip.block_type {
        return Err(Pkcs1Violation::BlockType);
    }
    if skip.delimiter {
        // Without the delimiter walk the message can only be located by its
        // protocol-fixed length.
        return Ok(em[k - expected_len..].to_vec());
    }
    match em[2..].iter().position(|b| *b == 0x00).map(|p| p + 2) {
        Some(index) if index >= 10 => Ok(em[index + 1..].to_vec()),
        // PS must be at least eight bytes long.
        Some(_) => Err(Pkcs1Violation::ShortPadding),
        None => Err(Pkcs1Violation::Delimiter),
    }
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// 2048-bit MODP group (RFC 3526, group 14), the tool's ephemeral DH domain.
const DH_P_2048: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

pub fn dh_prime() -> BigUint {
    BigUint::parse_bytes(DH_P_2048.as_bytes(), 16).expect("well-known prime")
}

pub fn dh_generator() -> BigUint {
    BigUint::from(2u32)
}

/// Server-side ephemeral DH state.
pub struct DhEphemeral {
    p: BigUint,
    g: BigUint,
    x: BigUint,
    pub public: Vec<u8>,
}

impl DhEphemeral {
    pub fn generate() -> DhEphemeral {
        let p = dh_prime();
        let g = dh_generator();
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let x = BigUint::from_bytes_be(&secret);
        let public = g.modpow(&x, &p).to_bytes_be();
        DhEphemeral { p, g, x, public }
    }

    pub fn prime_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    pub fn generator_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// Shared secret from the peer's public value, leading zeros stripped.
    pub fn agree(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        let gy = BigUint::from_bytes_be(peer_public);
        if gy < BigUint::from(2u32) || gy >= self.p {
            return Err(Error::Tls("bad Diffie-Hellman public value".to_string()));
        }
        Ok(gy.modpow(&self.x, &self.p).to_bytes_be())
    }
}

/// Client side of a DH exchange against received server parameters.
pub fn dh_client_exchange(p: &[u8], g: &[u8], server_public: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let p = BigUint::from_bytes_be(p);
    let g = BigUint::from_bytes_be(g);
    let ys = BigUint::from_bytes_be(server_public);
    if p.bits() < 512 {
        return Err(Error::Tls("Diffie-Hellman prime too small".to_string()));
    }
    if ys < BigUint::from(2u32) || ys >= p {
        return Err(Error::Tls("bad Diffie-Hellman public value".to_string()));
    }
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let x = BigUint::from_bytes_be(&secret);
    let own_public = g.modpow(&x, &p).to_bytes_be();
    let shared = ys.modpow(&x, &p).to_bytes_be();
    Ok((own_public, shared))
}

/// Server-side ephemeral ECDHE state (secp256r1).
pub struct EcdhEphemeral {
    secret: EphemeralSecret,
    pub public_point: Vec<u8>,
}

pub const NAMED_CURVE_SECP256R1: u16 = 23;

impl EcdhEphemeral {
    pub fn generate() -> EcdhEphemeral {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_point = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        EcdhEphemeral { secret, public_point }
    }

    pub fn agree(&self, peer_point: &[u8]) -> Result<Vec<u8>> {
        let peer = PublicKey::from_sec1_bytes(peer_point)
            .map_err(|_| Error::Tls("bad ECDHE public point".to_string()))?;
        let shared = self.secret.diffie_hellman(&peer);
        Ok(shared.raw_secret_bytes().to_vec())
    }
}
