//! Debug channel of the backend engine.
//!
//! The engine narrates its progress in a fixed vocabulary that the filters
//! in [`crate::tls::log_filter`] translate into canonical trace lines.
//! Numeric debug levels follow the usual TLS-library convention (1 = state
//! changes, 2 = values, 3 = details, 4 = raw dumps).

use tlsprobe_tooling::logging::{LogLevel, Logger};

#[derive(Clone)]
pub struct DebugSink {
    logger: Logger,
}

const CATEGORY: &str = "Backend";

fn convert_level(level: u8) -> LogLevel {
    if level > 3 {
        LogLevel::Low
    } else if level > 2 {
        LogLevel::Medium
    } else if level > 0 {
        LogLevel::High
    } else {
        LogLevel::Off
    }
}

impl DebugSink {
    pub fn new(logger: Logger) -> DebugSink {
        DebugSink { logger }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn msg(&self, level: u8, text: &str) {
        self.logger
            .log(convert_level(level), CATEGORY, file!(), line!(), text);
    }

    /// Labeled hex dump: a `dumping '<label>' (<N> bytes)` header followed by
    /// offset-prefixed lines of 16 bytes.
    pub fn buf(&self, level: u8, label: &str, data: &[u8]) {
        let log_level = convert_level(level);
        self.logger.log(
            log_level,
            CATEGORY,
            file!(),
            line!(),
            &format!("dumping '{}' ({} bytes)", label, data.len()),
        );
        for (index, chunk) in data.chunks(16).enumerate() {
            let mut line = format!("{:04x}:  ", index * 16);
            for byte in chunk {
                line.push_str(&format!("{:02x} ", byte));
            }
            line.push(' ');
            for byte in chunk {
                let c = *byte as char;
                line.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
            }
            self.logger.log(log_level, CATEGORY, file!(), line!(), &line);
        }
    }

    /// Big-number dump: a `value of '<label>' (<N> bits) is:` header followed
    /// by space-prefixed byte lines. The next regular debug line terminates
    /// the dump for the filter that collects it.
    pub fn mpi(&self, level: u8, label: &str, data: &[u8]) {
        let log_level = convert_level(level);
        let stripped: &[u8] = {
            let first = data.iter().position(|b| *b != 0).unwrap_or(data.len());
            &data[first..]
        };
        let bits = if stripped.is_empty() {
            0
        } else {
            stripped.len() * 8 - stripped[0].leading_zeros() as usize
        };
        self.logger.log(
            log_level,
            CATEGORY,
            file!(),
            line!(),
            &format!("value of '{}' ({} bits) is:", label, bits),
        );
        for chunk in stripped.chunks(16) {
            let mut line = String::from(" ");
            for (i, byte) in chunk.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                line.push_str(&format!("{:02x}", byte));
            }
            self.logger.log(log_level, CATEGORY, file!(), line!(), &line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_like_a_tls_library() {
        assert_eq!(convert_level(1), LogLevel::High);
        assert_eq!(convert_level(2), LogLevel::High);
        assert_eq!(convert_level(3), LogLevel::Medium);
        assert_eq!(convert_level(4), LogLevel::Low);
        assert_eq!(convert_level(0), LogLevel::Off);
    }

    #[test]
    fn buf_dump_lines_match_the_filter_grammar() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(LogLevel::Low);
        let dbg = DebugSink::new(logger);
        dbg.buf(4, "client hello, random bytes", &[0xaa; 18]);
        let messages = trace.messages();
        assert!(messages.iter().any(|m| m == "dumping 'client hello, random bytes' (18 bytes)"));
        assert!(messages.iter().any(|m| m.starts_with("0000:  aa aa ")));
        assert!(messages.iter().any(|m| m.starts_with("0010:  aa aa ")));
    }

    #[test]
    fn mpi_dump_strips_leading_zero_bytes() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(LogLevel::Low);
        let dbg = DebugSink::new(logger);
        dbg.mpi(3, "DHM: P ", &[0x00, 0x03, 0xff]);
        let messages = trace.messages();
        assert!(messages.iter().any(|m| m == "value of 'DHM: P ' (10 bits) is:"));
        assert!(messages.iter().any(|m| m == " 03 ff"));
    }
}
