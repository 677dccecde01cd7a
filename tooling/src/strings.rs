//! String and hex formatting helpers shared across the tool.

/// Format bytes as lower-case hex with a space after every byte, the way the
/// trace prints byte fields (`"c0 2f "`).
pub fn byte_array_to_hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        out.push_str(&hex::encode([*byte]));
        out.push(' ');
    }
    out
}

/// Compact lower-case hex without separators (NSS key-log fields).
pub fn byte_array_to_compact_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse a hex string that may contain whitespace between bytes.
pub fn hex_string_to_byte_array(hex_string: &str) -> Vec<u8> {
    let compact: String = hex_string.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    hex::decode(&compact).unwrap_or_default()
}

pub fn remove_newlines(text: &str) -> String {
    text.replace('\r', "").replace('\n', " ")
}

pub fn trim(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_with_spaces() {
        let bytes = [0xc0, 0x2f, 0x00];
        let text = byte_array_to_hex_string(&bytes);
        assert_eq!(text, "c0 2f 00 ");
        assert_eq!(hex_string_to_byte_array(&text), bytes);
    }

    #[test]
    fn compact_hex_has_no_spaces() {
        assert_eq!(byte_array_to_compact_hex(&[0xab, 0x01]), "ab01");
    }

    #[test]
    fn newlines_become_spaces() {
        assert_eq!(remove_newlines("a\r\nb\nc"), "a b c");
    }
}
