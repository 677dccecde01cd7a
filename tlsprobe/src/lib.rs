//! Scriptable TLS conformance and negative-testing endpoint.
//!
//! The tool acts as a TLS 1.0/1.1/1.2 client or server against a peer under
//! test, drives the handshake one state at a time, and applies scripted
//! deviations ("manipulations") from protocol-correct behavior at specified
//! points. Everything that happens on the wire is written to a structured
//! trace on stdout.

pub mod configuration;
pub mod error;
pub mod manipulation;
pub mod network;
pub mod tls;

pub use error::{Error, Result};
