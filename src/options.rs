//! The typed option surface (spec §4.5/§4.7): string names map to
//! `(get, set, type)` triplets. nng-rs expresses the same idea with its
//! `create_option!` macro pairing a Rust type with `getopt_*`/`setopt_*`
//! FFI shims (`examples/other_examples/292cf82f_neachdainn-nng-rs__src-options-types.rs`).
//! This crate has no FFI getter/setter pair to wrap — the "get" and "set"
//! are just field reads/writes — so the macro idiom is kept in spirit as a
//! single dynamically-typed [`OptionValue`] plus a dispatch table built
//! from name constants, rather than ported literally.

use std::time::Duration;

use crate::addr::SocketAddr;
use crate::error::{Error, Result};

/// Socket-level option names (spec §6 "Socket options").
pub const RECV_TIMEOUT: &str = "recv-timeout";
pub const SEND_TIMEOUT: &str = "send-timeout";
pub const RECV_BUF: &str = "recv-buf";
pub const SEND_BUF: &str = "send-buf";
pub const RECV_MAX: &str = "recv-max";
pub const RECONNECT_MIN: &str = "reconnect-min";
pub const RECONNECT_MAX: &str = "reconnect-max";

/// Endpoint-level option names, over and above the socket table (spec §3
/// "the original's `tlstran_ep_options`").
pub const URL: &str = "url";
pub const LOCAL_ADDR: &str = "local-addr";
pub const REMOTE_ADDR: &str = "remote-addr";

/// The ceiling `recv-max` may be set to on 64-bit platforms (spec §6).
pub const RECV_MAX_CEILING: u64 = 4 * 1024 * 1024 * 1024;

/// A dynamically typed option value — the currency every `get_option`/
/// `set_option` implementation in this crate trades in.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    I32(i32),
    U64(u64),
    Duration(Duration),
    String(String),
    SocketAddr(SocketAddr),
}

impl OptionValue {
    pub fn as_duration(self) -> Result<Duration> {
        match self {
            OptionValue::Duration(d) => Ok(d),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_i32(self) -> Result<i32> {
        match self {
            OptionValue::I32(v) => Ok(v),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_u64(self) -> Result<u64> {
        match self {
            OptionValue::U64(v) => Ok(v),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_string(self) -> Result<String> {
        match self {
            OptionValue::String(v) => Ok(v),
            _ => Err(Error::BadType),
        }
    }
}

/// Validates a duration-typed option: negative durations can't be
/// represented by `std::time::Duration` itself, but callers that parse
/// milliseconds from a signed source should route through this so the
/// negative case reports `invalid-argument` rather than panicking on the
/// `as u64` cast (spec §4.5 "Range violations").
pub fn checked_millis(ms: i64) -> Result<Duration> {
    if ms < 0 {
        return Err(Error::InvalidArgument(format!("negative duration: {ms}ms")));
    }
    Ok(Duration::from_millis(ms as u64))
}

/// Validates `recv-max` against the platform ceiling (spec §4.5, §6).
pub fn checked_recv_max(v: u64) -> Result<u64> {
    if v > RECV_MAX_CEILING {
        return Err(Error::InvalidArgument(format!(
            "recv-max {v} exceeds the {RECV_MAX_CEILING} byte ceiling"
        )));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_duration_is_invalid_argument() {
        assert!(matches!(checked_millis(-1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn oversize_recv_max_is_invalid_argument() {
        assert!(matches!(
            checked_recv_max(RECV_MAX_CEILING + 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(checked_recv_max(RECV_MAX_CEILING).is_ok());
    }

    #[test]
    fn wrong_variant_is_bad_type() {
        assert!(matches!(OptionValue::Bool(true).as_i32(), Err(Error::BadType)));
    }
}
