//! Shared helpers for the integration tests: a minimal self-signed RSA
//! certificate and a shareable write sink.

#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

static TEST_KEY: Lazy<RsaPrivateKey> =
    Lazy::new(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).expect("generate test key"));

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 128 {
        out.push(len as u8);
    } else if len < 256 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn algorithm_identifier_sha256_rsa() -> Vec<u8> {
    let oid = der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]);
    let mut content = oid;
    content.extend_from_slice(&[0x05, 0x00]);
    der(0x30, &content)
}

fn common_name(name: &str) -> Vec<u8> {
    let oid = der(0x06, &[0x55, 0x04, 0x03]);
    let value = der(0x0c, name.as_bytes());
    let mut attribute = oid;
    attribute.extend_from_slice(&value);
    let attribute = der(0x30, &attribute);
    let set = der(0x31, &attribute);
    der(0x30, &set)
}

fn validity() -> Vec<u8> {
    let not_before = der(0x17, b"250101000000Z");
    let not_after = der(0x17, b"350101000000Z");
    let mut content = not_before;
    content.extend_from_slice(&not_after);
    der(0x30, &content)
}

/// Self-signed certificate (DER) plus the matching PKCS#1 private key (DER).
/// The shape is the minimum x509 parsers accept; nothing verifies the chain.
pub fn self_signed_identity() -> (Vec<u8>, Vec<u8>) {
    let key: &RsaPrivateKey = &TEST_KEY;
    let public = RsaPublicKey::from(key);
    let spki = public.to_public_key_der().expect("spki").as_bytes().to_vec();

    let mut tbs_content = der(0x02, &[0x01]);
    tbs_content.extend_from_slice(&algorithm_identifier_sha256_rsa());
    tbs_content.extend_from_slice(&common_name("tlsprobe-test"));
    tbs_content.extend_from_slice(&validity());
    tbs_content.extend_from_slice(&common_name("tlsprobe-test"));
    tbs_content.extend_from_slice(&spki);
    let tbs = der(0x30, &tbs_content);

    let digest = Sha256::digest(&tbs);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("sign certificate");
    let mut bit_string_content = vec![0u8];
    bit_string_content.extend_from_slice(&signature);

    let mut certificate_content = tbs;
    certificate_content.extend_from_slice(&algorithm_identifier_sha256_rsa());
    certificate_content.extend_from_slice(&der(0x03, &bit_string_content));
    let certificate = der(0x30, &certificate_content);

    let key_der = key.to_pkcs1_der().expect("key der").as_bytes().to_vec();
    (certificate, key_der)
}

/// Write sink that can be inspected after the session owned it.
#[derive(Clone)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> SharedSink {
        SharedSink(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
