//! Filters translating the backend's native debug lines into the canonical
//! trace vocabulary.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tlsprobe_tooling::logging::{LogFilter, LogLevel, Logger};
use tlsprobe_tooling::{strings, trace_line};

use crate::tls::{content_type, handshake_type, TlsVersion};

const CATEGORY: &str = "TLS";

/// Install the trace filters on the logger, in their fixed order.
pub fn register_filters(logger: &Logger) {
    logger.add_filter(Box::new(translate_string));
    logger.add_filter(Box::new(translate_regex));
    logger.add_filter(Box::new(translate_regex_dec_to_hex));
    logger.add_filter(make_hex_dump_filter());
    logger.add_filter(make_bits_filter());
}

static STRING_TRANSLATION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Receiving
        ("<= parse client hello", "Valid ClientHello message received."),
        ("bad client hello message", "Bad ClientHello message received."),
        ("<= parse server hello", "Valid ServerHello message received."),
        ("bad server hello message", "Bad ServerHello message received."),
        ("<= parse certificate", "Valid Certificate message received."),
        ("bad certificate message", "Bad Certificate message received."),
        ("<= parse server key exchange", "Valid ServerKeyExchange message received."),
        ("bad server key exchange message", "Bad ServerKeyExchange message received."),
        ("got a certificate request", "Valid CertificateRequest message received."),
        ("bad certificate request message", "Bad CertificateRequest message received."),
        ("<= parse server hello done", "Valid ServerHelloDone message received."),
        ("bad server hello done message", "Bad ServerHelloDone message received."),
        ("<= parse client key exchange", "Valid ClientKeyExchange message received."),
        ("bad client key exchange", "Bad ClientKeyExchange message received."),
        ("<= parse certificate verify", "Valid CertificateVerify message received."),
        ("bad certificate verify message", "Bad CertificateVerify message received."),
        ("<= parse change cipher spec", "Valid ChangeCipherSpec message received."),
        ("bad change cipher spec message", "Bad ChangeCipherSpec message received."),
        ("<= parse finished", "Valid Finished message received."),
        ("bad finished message", "Bad Finished message received."),
        // Transmitting
        ("<= write client hello", "ClientHello message transmitted."),
        ("<= write server hello", "ServerHello message transmitted."),
        ("<= write certificate", "Certificate message transmitted."),
        ("<= write server key exchange", "ServerKeyExchange message transmitted."),
        ("<= write certificate request", "CertificateRequest message transmitted."),
        ("<= write server hello done", "ServerHelloDone message transmitted."),
        ("<= write client key exchange", "ClientKeyExchange message transmitted."),
        ("<= write certificate verify", "CertificateVerify message transmitted."),
        ("<= write change cipher spec", "ChangeCipherSpec message transmitted."),
        ("<= write finished", "Finished message transmitted."),
    ])
});

fn translate_string(logger: &Logger, _level: LogLevel, _origin: &str, message: &str) {
    if let Some(translation) = STRING_TRANSLATION.get(message) {
        trace_line!(logger, LogLevel::High, CATEGORY, "{}", translation);
    }
}

static REGEX_TRANSLATION: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"^server hello, received ciphersuite: ([0-9a-f]{2})([0-9a-f]{2})$")
                .expect("regex"),
            "ServerHello.cipher_suite=$1 $2",
        ),
        (
            Regex::new(r"^server hello, chosen ciphersuite: ([0-9a-f]{2})([0-9a-f]{2})$")
                .expect("regex"),
            "ServerHello.cipher_suite=$1 $2",
        ),
        (
            Regex::new(r"^got an alert message, type: \[[0-9]+:[0-9]+\]$").expect("regex"),
            "Alert message received.",
        ),
        (
            Regex::new(r"^padding_length: ([0-9a-f]{2})$").expect("regex"),
            "Finished.GenericBlockCipher.padding_length=$1",
        ),
    ]
});

fn translate_regex(logger: &Logger, _level: LogLevel, _origin: &str, message: &str) {
    for (pattern, template) in REGEX_TRANSLATION.iter() {
        if let Some(captures) = pattern.captures(message) {
            let mut output = String::new();
            captures.expand(template, &mut output);
            trace_line!(logger, LogLevel::High, CATEGORY, "{}", output);
        }
    }
}

static DEC_TO_HEX_TRANSLATION: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"^server hello, compress alg\.: ([0-9]+)$").expect("regex"),
            "ServerHello.compression_method=",
        ),
        (
            Regex::new(r"^got an alert message, type: \[([0-9]+):[0-9]+\]$").expect("regex"),
            "Alert.level=",
        ),
        (
            Regex::new(r"^got an alert message, type: \[[0-9]+:([0-9]+)\]$").expect("regex"),
            "Alert.description=",
        ),
        (
            Regex::new(r"^Server used HashAlgorithm ([0-9]+)$").expect("regex"),
            "ServerKeyExchange.signed_params.algorithm.hash=",
        ),
        (
            Regex::new(r"^Server used SignatureAlgorithm ([0-9]+)$").expect("regex"),
            "ServerKeyExchange.signed_params.algorithm.signature=",
        ),
    ]
});

fn translate_regex_dec_to_hex(logger: &Logger, _level: LogLevel, _origin: &str, message: &str) {
    for (pattern, prefix) in DEC_TO_HEX_TRANSLATION.iter() {
        if let Some(captures) = pattern.captures(message) {
            if let Ok(number) = captures[1].parse::<u64>() {
                trace_line!(logger, LogLevel::High, CATEGORY, "{}{:02x}", prefix, number);
            }
        }
    }
}

static DUMP_INTERCEPTION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("client hello, version", "ClientHello.client_version"),
        ("client hello, random bytes", "ClientHello.random"),
        ("client hello, session id", "ClientHello.session_id"),
        ("client hello, ciphersuitelist", "ClientHello.cipher_suites"),
        ("client hello, compression", "ClientHello.compression_methods"),
        ("client hello extensions", "ClientHello.extensions"),
        ("server hello, version", "ServerHello.server_version"),
        ("server hello, random bytes", "ServerHello.random"),
        ("server hello, session id", "ServerHello.session_id"),
        ("server hello, extensions", "ServerHello.extensions"),
        ("server key exchange", "ServerKeyExchange"),
        ("signature", "ServerKeyExchange.signed_params.signature"),
        ("md5_hash", "ServerKeyExchange.signed_params.md5_hash"),
        ("sha_hash", "ServerKeyExchange.signed_params.sha_hash"),
        ("premaster secret", "ClientKeyExchange.exchange_keys.pre_master_secret"),
        ("master secret", "ClientKeyExchange.exchange_keys.master_secret"),
        ("input record from network", "TLS Record"),
        ("remaining content in record", "Handshake Message"),
        ("new session ticket, ticket", "NewSessionTicket.ticket"),
        ("heartbeat input record after decrypt", "Heartbeat Record"),
    ])
});

static DUMP_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dumping '([^']+)' \(([0-9]+) bytes\)$").expect("regex"));
static HEX_DUMP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{4}:  (([0-9a-f]{2} ){1,16}) .*$").expect("regex"));

fn make_hex_dump_filter() -> LogFilter {
    let mut lines_to_collect: usize = 0;
    let mut collected_bytes = String::new();
    let mut final_output = String::new();
    Box::new(move |logger: &Logger, _level, _origin, message: &str| {
        if let Some(captures) = DUMP_HEADER.captures(message) {
            if let Some(target) = DUMP_INTERCEPTION.get(&captures[1]) {
                let num_bytes: usize = captures[2].parse().unwrap_or(0);
                lines_to_collect = (num_bytes + 15) / 16;
                collected_bytes.clear();
                final_output = (*target).to_string();
            }
        }
        if lines_to_collect > 0 {
            if let Some(captures) = HEX_DUMP_LINE.captures(message) {
                collected_bytes.push_str(&captures[1]);
                lines_to_collect -= 1;
            }
        }
        if lines_to_collect == 0 && !final_output.is_empty() {
            let bytes = strings::hex_string_to_byte_array(&collected_bytes);
            match final_output.as_str() {
                "ServerKeyExchange" => emit_ecdhe_params(logger, &bytes),
                "TLS Record" => log_tls_record(logger, &bytes),
                "Handshake Message" => log_handshake_message(logger, None, &bytes),
                "Heartbeat Record" => log_heartbeat_record(logger, &bytes),
                label => {
                    trace_line!(logger, LogLevel::High, CATEGORY, "{}={}", label, collected_bytes)
                }
            }
            final_output.clear();
            collected_bytes.clear();
        }
    })
}

/// Re-emit a ServerKeyExchange dump as its ECDHE parameters. Dumps that do
/// not carry a named-curve structure (e.g. DHE) stay silent.
fn emit_ecdhe_params(logger: &Logger, bytes: &[u8]) {
    if bytes.len() < 5 || bytes[0] != 3 {
        return;
    }
    let named_curve = ((bytes[1] as u16) << 8) | bytes[2] as u16;
    if named_curve != crate::tls::backend::kx::NAMED_CURVE_SECP256R1 {
        return;
    }
    let point_length = bytes[3] as usize;
    if point_length == 0 || bytes.len() < 4 + point_length || bytes[4] != 0x04 {
        return;
    }
    let coordinates = &bytes[5..4 + point_length];
    let half = coordinates.len() / 2;
    trace_line!(
        logger,
        LogLevel::High,
        CATEGORY,
        "ServerKeyExchange.params.curve_params.namedcurve={:02x}",
        named_curve
    );
    trace_line!(
        logger,
        LogLevel::High,
        CATEGORY,
        "ServerKeyExchange.params.public=04 {}{}",
        strings::byte_array_to_hex_string(&coordinates[..half]),
        strings::byte_array_to_hex_string(&coordinates[half..])
    );
}

fn log_tls_record(logger: &Logger, bytes: &[u8]) {
    if bytes.len() < 5 {
        return;
    }
    if bytes[0] == content_type::HANDSHAKE {
        let version = TlsVersion::new(bytes[1], bytes[2]);
        log_handshake_message(logger, Some(version), &bytes[5..]);
    }
}

/// Descend into Certificate and CertificateRequest messages.
fn log_handshake_message(logger: &Logger, version: Option<TlsVersion>, bytes: &[u8]) {
    if bytes.len() < 4 {
        return;
    }
    let msg_type = bytes[0];
    let announced =
        ((bytes[1] as usize) << 16) | ((bytes[2] as usize) << 8) | bytes[3] as usize;
    let body = &bytes[4..];
    if body.len() < announced {
        return;
    }
    match msg_type {
        handshake_type::CERTIFICATE => {
            if body.len() < 3 {
                return;
            }
            let list_length =
                ((body[0] as usize) << 16) | ((body[1] as usize) << 8) | body[2] as usize;
            let mut rest = &body[3..];
            let mut read = 0;
            let mut index = 0u32;
            while read < list_length && rest.len() >= 3 {
                let certificate_length =
                    ((rest[0] as usize) << 16) | ((rest[1] as usize) << 8) | rest[2] as usize;
                if rest.len() < 3 + certificate_length {
                    return;
                }
                trace_line!(
                    logger,
                    LogLevel::High,
                    CATEGORY,
                    "Certificate.certificate_list[{}]={}",
                    index,
                    strings::byte_array_to_hex_string(&rest[3..3 + certificate_length])
                );
                rest = &rest[3 + certificate_length..];
                read += 3 + certificate_length;
                index += 1;
            }
            trace_line!(
                logger,
                LogLevel::High,
                CATEGORY,
                "Certificate.certificate_list.size={}",
                index
            );
        }
        handshake_type::CERTIFICATE_REQUEST => {
            if body.is_empty() {
                return;
            }
            let types_length = body[0] as usize;
            if body.len() < 1 + types_length {
                return;
            }
            trace_line!(
                logger,
                LogLevel::High,
                CATEGORY,
                "CertificateRequest.certificate_types={}",
                strings::byte_array_to_hex_string(&body[1..1 + types_length])
            );
            let mut rest = &body[1 + types_length..];
            if version == Some(TlsVersion::TLS1_2) {
                // supported_signature_algorithms only exists in TLS 1.2.
                if rest.len() < 2 {
                    return;
                }
                let algorithms_length = ((rest[0] as usize) << 8) | rest[1] as usize;
                if rest.len() < 2 + algorithms_length {
                    return;
                }
                trace_line!(
                    logger,
                    LogLevel::High,
                    CATEGORY,
                    "CertificateRequest.supported_signature_algorithms={}",
                    strings::byte_array_to_hex_string(&rest[2..2 + algorithms_length])
                );
                rest = &rest[2 + algorithms_length..];
            }
            if rest.len() < 2 {
                return;
            }
            let authorities_length = ((rest[0] as usize) << 8) | rest[1] as usize;
            if rest.len() < 2 + authorities_length {
                return;
            }
            trace_line!(
                logger,
                LogLevel::High,
                CATEGORY,
                "CertificateRequest.certificate_authorities={}",
                strings::byte_array_to_hex_string(&rest[2..2 + authorities_length])
            );
        }
        _ => {}
    }
}

fn log_heartbeat_record(logger: &Logger, bytes: &[u8]) {
    if bytes.len() < 5 || bytes[0] != content_type::HEARTBEAT {
        return;
    }
    let message = &bytes[5..];
    if message.len() < 3 {
        return;
    }
    let payload_length = ((message[1] as usize) << 8) | message[2] as usize;
    if message.len() < 3 + payload_length {
        return;
    }
    trace_line!(
        logger,
        LogLevel::High,
        CATEGORY,
        "Heartbeat data size including padding={}",
        message.len()
    );
    trace_line!(logger, LogLevel::High, CATEGORY, "Heartbeat.type={}", message[0]);
    trace_line!(
        logger,
        LogLevel::High,
        CATEGORY,
        "Heartbeat.payload_length={}",
        payload_length
    );
    trace_line!(
        logger,
        LogLevel::High,
        CATEGORY,
        "Heartbeat.payload_data={}",
        strings::byte_array_to_hex_string(&message[3..3 + payload_length])
    );
}

static BITS_INTERCEPTION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("DHM: P ", "ServerKeyExchange.params.dh_p"),
        ("DHM: G ", "ServerKeyExchange.params.dh_g"),
        ("DHM: GY", "ServerKeyExchange.params.dh_Ys"),
    ])
});

static BITS_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^value of '([^']+)' \(([0-9]+) bits\) is:$").expect("regex"));
static BITS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ (([0-9a-f]{2} ?){1,16})$").expect("regex"));

fn make_bits_filter() -> LogFilter {
    let mut final_output = String::new();
    Box::new(move |logger: &Logger, _level, _origin, message: &str| {
        if !final_output.is_empty() {
            if let Some(captures) = BITS_LINE.captures(message) {
                final_output.push_str(&captures[1]);
                final_output.push(' ');
            } else {
                trace_line!(logger, LogLevel::High, CATEGORY, "{}", final_output);
                final_output.clear();
            }
        }
        if final_output.is_empty() {
            if let Some(captures) = BITS_HEADER.captures(message) {
                if let Some(target) = BITS_INTERCEPTION.get(&captures[1]) {
                    final_output = format!("{}=", target);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filtered_logger() -> (Logger, tlsprobe_tooling::logging::CapturedTrace) {
        let (logger, trace) = Logger::capturing();
        register_filters(&logger);
        (logger, trace)
    }

    fn feed(logger: &Logger, message: &str) {
        // Backend lines arrive below the gate; only canonical lines show.
        logger.log(LogLevel::Low, "Backend", "backend.rs", 1, message);
    }

    #[test]
    fn status_strings_become_canonical_events() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "<= parse server hello");
        feed(&logger, "<= write change cipher spec");
        feed(&logger, "bad finished message");
        assert!(trace.contains_message("Valid ServerHello message received."));
        assert!(trace.contains_message("ChangeCipherSpec message transmitted."));
        assert!(trace.contains_message("Bad Finished message received."));
    }

    #[test]
    fn alert_lines_emit_level_and_description_in_hex() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "got an alert message, type: [2:51]");
        assert!(trace.contains_message("Alert message received."));
        assert!(trace.contains_message("Alert.level=02"));
        assert!(trace.contains_message("Alert.description=33"));
    }

    #[test]
    fn chosen_ciphersuite_is_reformatted() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "server hello, chosen ciphersuite: c02f");
        assert!(trace.contains_message("ServerHello.cipher_suite=c0 2f"));
    }

    #[test]
    fn padding_length_is_relabeled() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "padding_length: 0b");
        assert!(trace.contains_message("Finished.GenericBlockCipher.padding_length=0b"));
    }

    #[test]
    fn hex_dumps_are_collected_and_relabeled() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "dumping 'server hello, version' (2 bytes)");
        feed(&logger, "0000:  03 03  ..");
        assert!(trace.contains_message("ServerHello.server_version=03 03 "));
    }

    #[test]
    fn multi_line_dumps_accumulate() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "dumping 'client hello, random bytes' (32 bytes)");
        feed(&logger, "0000:  aa aa aa aa aa aa aa aa aa aa aa aa aa aa aa aa  ................");
        feed(&logger, "0010:  bb bb bb bb bb bb bb bb bb bb bb bb bb bb bb bb  ................");
        let expected = format!(
            "ClientHello.random={}{}",
            "aa ".repeat(16),
            "bb ".repeat(16)
        );
        assert!(trace.contains_message(&expected));
    }

    #[test]
    fn server_key_exchange_dump_is_parsed_as_ecdhe() {
        let (logger, trace) = filtered_logger();
        let mut params = vec![3u8, 0, 23, 65, 0x04];
        params.extend(std::iter::repeat(0x11).take(32));
        params.extend(std::iter::repeat(0x22).take(32));
        feed(&logger, &format!("dumping 'server key exchange' ({} bytes)", params.len()));
        for (index, chunk) in params.chunks(16).enumerate() {
            let mut line = format!("{:04x}:  ", index * 16);
            for byte in chunk {
                line.push_str(&format!("{:02x} ", byte));
            }
            line.push(' ');
            line.push_str(&".".repeat(chunk.len()));
            feed(&logger, &line);
        }
        assert!(trace.contains_message("ServerKeyExchange.params.curve_params.namedcurve=17"));
        let expected = format!(
            "ServerKeyExchange.params.public=04 {}{}",
            "11 ".repeat(32),
            "22 ".repeat(32)
        );
        assert!(trace.contains_message(&expected));
    }

    #[test]
    fn record_dump_descends_into_certificate() {
        let (logger, trace) = filtered_logger();
        let cert = [0xde, 0xad, 0xbe, 0xef];
        // Certificate handshake message with a single four-byte entry.
        let mut hs = vec![handshake_type::CERTIFICATE, 0, 0, 10, 0, 0, 7, 0, 0, 4];
        hs.extend_from_slice(&cert);
        let mut record = vec![content_type::HANDSHAKE, 3, 3, 0, hs.len() as u8];
        record.extend_from_slice(&hs);
        feed(&logger, &format!("dumping 'input record from network' ({} bytes)", record.len()));
        for (index, chunk) in record.chunks(16).enumerate() {
            let mut line = format!("{:04x}:  ", index * 16);
            for byte in chunk {
                line.push_str(&format!("{:02x} ", byte));
            }
            line.push(' ');
            line.push_str(&".".repeat(chunk.len()));
            feed(&logger, &line);
        }
        assert!(trace.contains_message("Certificate.certificate_list[0]=de ad be ef "));
        assert!(trace.contains_message("Certificate.certificate_list.size=1"));
    }

    #[test]
    fn dhm_bit_dumps_are_intercepted() {
        let (logger, trace) = filtered_logger();
        feed(&logger, "value of 'DHM: P ' (16 bits) is:");
        feed(&logger, " c2 3f");
        // Any following line terminates the collection.
        feed(&logger, "<= parse server key exchange");
        assert!(trace.contains_message("ServerKeyExchange.params.dh_p=c2 3f "));
        assert!(trace.contains_message("Valid ServerKeyExchange message received."));
    }

    #[test]
    fn heartbeat_record_dump_is_broken_down() {
        let (logger, trace) = filtered_logger();
        // type=1, payload_length=3, payload "abc", padding
        let message = [1u8, 0, 3, 0x61, 0x62, 0x63, 0, 0];
        let mut record = vec![content_type::HEARTBEAT, 3, 3, 0, message.len() as u8];
        record.extend_from_slice(&message);
        feed(&logger, &format!("dumping 'heartbeat input record after decrypt' ({} bytes)", record.len()));
        let mut line = String::from("0000:  ");
        for byte in &record {
            line.push_str(&format!("{:02x} ", byte));
        }
        line.push(' ');
        line.push_str(&".".repeat(record.len()));
        feed(&logger, &line);
        assert!(trace.contains_message("Heartbeat data size including padding=8"));
        assert!(trace.contains_message("Heartbeat.type=1"));
        assert!(trace.contains_message("Heartbeat.payload_length=3"));
        assert!(trace.contains_message("Heartbeat.payload_data=61 62 63 "));
    }
}
