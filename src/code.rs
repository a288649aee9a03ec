//! Return-code vocabulary shared by every facade call and upcall.
//!
//! # Design Decisions
//! - A newtype over `isize` rather than an enum: handlers return either one of
//!   the seven engine codes or an HTTP status, and both travel in one value
//! - Values >= 300 are "special" (final) responses

use std::fmt;

use serde::{Deserialize, Serialize};

/// Engine return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(pub isize);

impl Code {
    pub const OK: Code = Code(0);
    pub const ERROR: Code = Code(-1);
    pub const AGAIN: Code = Code(-2);
    pub const BUSY: Code = Code(-3);
    pub const DONE: Code = Code(-4);
    pub const DECLINED: Code = Code(-5);
    pub const ABORT: Code = Code(-6);

    /// First status code treated as a final response by the phase pipeline.
    pub const SPECIAL_RESPONSE: isize = 300;

    /// Code carrying an HTTP status.
    pub const fn status(status: u16) -> Code {
        Code(status as isize)
    }

    pub fn is_ok(self) -> bool {
        self == Code::OK
    }

    /// True for statuses the caller must treat as the final response.
    pub fn is_special_response(self) -> bool {
        self.0 >= Self::SPECIAL_RESPONSE
    }

    /// The HTTP status carried by this code, if any.
    pub fn as_status(self) -> Option<u16> {
        if (100..1000).contains(&self.0) {
            Some(self.0 as u16)
        } else {
            None
        }
    }
}

impl From<u16> for Code {
    fn from(status: u16) -> Self {
        Code::status(status)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Code::OK => write!(f, "OK"),
            Code::ERROR => write!(f, "ERROR"),
            Code::AGAIN => write!(f, "AGAIN"),
            Code::BUSY => write!(f, "BUSY"),
            Code::DONE => write!(f, "DONE"),
            Code::DECLINED => write!(f, "DECLINED"),
            Code::ABORT => write!(f, "ABORT"),
            Code(other) => write!(f, "{}", other),
        }
    }
}

/// Engine log levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Stderr = 0,
    Emerg = 1,
    Alert = 2,
    Crit = 3,
    #[serde(alias = "error")]
    Err = 4,
    Warn = 5,
    Notice = 6,
    #[default]
    Info = 7,
    Debug = 8,
}

impl LogLevel {
    /// Map a raw level number; out-of-range values clamp to `Debug`.
    pub fn from_raw(raw: usize) -> LogLevel {
        match raw {
            0 => LogLevel::Stderr,
            1 => LogLevel::Emerg,
            2 => LogLevel::Alert,
            3 => LogLevel::Crit,
            4 => LogLevel::Err,
            5 => LogLevel::Warn,
            6 => LogLevel::Notice,
            7 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Per-request processing phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    PostRead = 0,
    ServerRewrite = 1,
    FindConfig = 2,
    Rewrite = 3,
    PostRewrite = 4,
    Preaccess = 5,
    Access = 6,
    PostAccess = 7,
    Precontent = 8,
    Content = 9,
    Log = 10,
}

impl Phase {
    pub const COUNT: usize = 11;

    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::PostRead,
        Phase::ServerRewrite,
        Phase::FindConfig,
        Phase::Rewrite,
        Phase::PostRewrite,
        Phase::Preaccess,
        Phase::Access,
        Phase::PostAccess,
        Phase::Precontent,
        Phase::Content,
        Phase::Log,
    ];

    pub fn from_raw(raw: isize) -> Option<Phase> {
        usize::try_from(raw).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_response_threshold() {
        assert!(!Code::OK.is_special_response());
        assert!(!Code::status(200).is_special_response());
        assert!(Code::status(300).is_special_response());
        assert!(Code::status(500).is_special_response());
        assert_eq!(Code::DONE.as_status(), None);
        assert_eq!(Code::status(404).as_status(), Some(404));
    }

    #[test]
    fn phase_from_raw() {
        assert_eq!(Phase::from_raw(9), Some(Phase::Content));
        assert_eq!(Phase::from_raw(11), None);
        assert_eq!(Phase::from_raw(-1), None);
    }

    #[test]
    fn log_level_order() {
        assert!(LogLevel::Err < LogLevel::Info);
        assert_eq!(LogLevel::from_raw(42), LogLevel::Debug);
    }
}
