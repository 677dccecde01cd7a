//! Byte-level reading and writing of handshake structures.

use crate::error::{Error, Result};
use crate::tls::{CipherSuite, TlsVersion};

/// Cursor over received bytes. Every accessor fails instead of panicking so
/// malformed peer data surfaces as a TLS error.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Tls("message is shorter than announced".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(((b[0] as u16) << 8) | b[1] as u16)
    }

    pub fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    /// Vector with a one-byte length prefix.
    pub fn vec8(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Vector with a two-byte length prefix.
    pub fn vec16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn expect_empty(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::Tls(format!("trailing bytes after {}", what)));
        }
        Ok(())
    }
}

pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes()[1..]);
}

pub fn put_vec8(out: &mut Vec<u8>, value: &[u8]) {
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

pub fn put_vec16(out: &mut Vec<u8>, value: &[u8]) {
    put_u16(out, value.len() as u16);
    out.extend_from_slice(value);
}

/// Wrap a handshake message body into `msg_type | u24 length | body`.
pub fn handshake_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(msg_type);
    put_u24(&mut out, body.len() as u32);
    out.extend_from_slice(body);
    out
}

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub client_version: TlsVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<u8>,
    /// Raw extensions, order preserved.
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.client_version.major);
        body.push(self.client_version.minor);
        body.extend_from_slice(&self.random);
        put_vec8(&mut body, &self.session_id);
        let mut suites = Vec::with_capacity(self.cipher_suites.len() * 2);
        for suite in &self.cipher_suites {
            suites.push(suite.0);
            suites.push(suite.1);
        }
        put_vec16(&mut body, &suites);
        put_vec8(&mut body, &self.compression_methods);
        if !self.extensions.is_empty() {
            let mut extensions = Vec::new();
            for (typ, data) in &self.extensions {
                put_u16(&mut extensions, *typ);
                put_vec16(&mut extensions, data);
            }
            put_vec16(&mut body, &extensions);
        }
        body
    }

    pub fn parse(body: &[u8]) -> Result<ClientHello> {
        let mut r = Reader::new(body);
        let client_version = TlsVersion::new(r.u8()?, r.u8()?);
        let mut random = [0u8; 32];
        random.copy_from_slice(r.take(32)?);
        let session_id = r.vec8()?.to_vec();
        let suites_raw = r.vec16()?;
        if suites_raw.len() % 2 != 0 || suites_raw.is_empty() {
            return Err(Error::Tls("bad cipher suite list length".to_string()));
        }
        let cipher_suites = suites_raw
            .chunks(2)
            .map(|pair| CipherSuite(pair[0], pair[1]))
            .collect();
        let compression_methods = r.vec8()?.to_vec();
        let extensions = parse_extensions(&mut r)?;
        Ok(ClientHello {
            client_version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub server_version: TlsVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.server_version.major);
        body.push(self.server_version.minor);
        body.extend_from_slice(&self.random);
        put_vec8(&mut body, &self.session_id);
        body.push(self.cipher_suite.0);
        body.push(self.cipher_suite.1);
        body.push(self.compression_method);
        if !self.extensions.is_empty() {
            let mut extensions = Vec::new();
            for (typ, data) in &self.extensions {
                put_u16(&mut extensions, *typ);
                put_vec16(&mut extensions, data);
            }
            put_vec16(&mut body, &extensions);
        }
        body
    }

    pub fn parse(body: &[u8]) -> Result<ServerHello> {
        let mut r = Reader::new(body);
        let server_version = TlsVersion::new(r.u8()?, r.u8()?);
        let mut random = [0u8; 32];
        random.copy_from_slice(r.take(32)?);
        let session_id = r.vec8()?.to_vec();
        let cipher_suite = CipherSuite(r.u8()?, r.u8()?);
        let compression_method = r.u8()?;
        let extensions = parse_extensions(&mut r)?;
        Ok(ServerHello {
            server_version,
            random,
            session_id,
            cipher_suite,
            compression_method,
            extensions,
        })
    }
}

fn parse_extensions(r: &mut Reader<'_>) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut extensions = Vec::new();
    if r.remaining() == 0 {
        return Ok(extensions);
    }
    let mut ext = Reader::new(r.vec16()?);
    while ext.remaining() > 0 {
        let typ = ext.u16()?;
        let data = ext.vec16()?.to_vec();
        extensions.push((typ, data));
    }
    Ok(extensions)
}

/// Certificate message: a list of DER certificates.
pub fn encode_certificate(chain: &[Vec<u8>]) -> Vec<u8> {
    let mut list = Vec::new();
    for cert in chain {
        put_u24(&mut list, cert.len() as u32);
        list.extend_from_slice(cert);
    }
    let mut body = Vec::new();
    put_u24(&mut body, list.len() as u32);
    body.extend_from_slice(&list);
    body
}

pub fn parse_certificate(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut r = Reader::new(body);
    let list_len = r.u24()? as usize;
    let mut list = Reader::new(r.take(list_len)?);
    let mut chain = Vec::new();
    while list.remaining() > 0 {
        let cert_len = list.u24()? as usize;
        chain.push(list.take(cert_len)?.to_vec());
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello() -> ClientHello {
        ClientHello {
            client_version: TlsVersion::TLS1_2,
            random: [7u8; 32],
            session_id: vec![],
            cipher_suites: vec![CipherSuite(0xc0, 0x2f), CipherSuite(0x00, 0x2f)],
            compression_methods: vec![0],
            extensions: vec![(10, vec![0x00, 0x02, 0x00, 0x17])],
        }
    }

    #[test]
    fn client_hello_survives_encode_parse() {
        let hello = sample_client_hello();
        let parsed = ClientHello::parse(&hello.encode()).unwrap();
        assert_eq!(parsed.client_version, TlsVersion::TLS1_2);
        assert_eq!(parsed.cipher_suites, hello.cipher_suites);
        assert_eq!(parsed.extensions, hello.extensions);
    }

    #[test]
    fn truncated_client_hello_is_rejected() {
        let encoded = sample_client_hello().encode();
        assert!(ClientHello::parse(&encoded[..20]).is_err());
    }

    #[test]
    fn certificate_list_round_trip() {
        let chain = vec![vec![1u8, 2, 3], vec![4u8; 300]];
        let parsed = parse_certificate(&encode_certificate(&chain)).unwrap();
        assert_eq!(parsed, chain);
    }

    #[test]
    fn empty_cipher_suite_list_is_rejected() {
        let mut hello = sample_client_hello();
        hello.cipher_suites.clear();
        assert!(ClientHello::parse(&hello.encode()).is_err());
    }
}
