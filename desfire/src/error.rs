//! Error taxonomy of the DESFire core.


use std::fmt;

use crate::iso7816::apdu::WriteError;
use crate::iso7816::card::TransportError;
use crate::status::Status;


pub type Result<T> = std::result::Result<T, Error>;


#[derive(Debug)]
pub enum Error {
    /// Malformed caller input (out-of-range AID, wrong key length, …).
    InvalidArgument(&'static str),
    /// An APDU could not be serialised.
    ApduEncode(WriteError),
    /// The PICC answered with a non-success status. The session survives;
    /// the card is still in a defined state.
    ApduFail(Status),
    /// RF / timeout / IO failure below the framing layer. Fatal to the
    /// session.
    Transport(TransportError),
    /// CRC or MAC verification failed while unwrapping a response. Fatal to
    /// the session.
    Integrity,
    /// Authentication failed; the code indexes the failed protocol step, see
    /// [`auth_error_description`].
    Auth(u16),
    /// The requested combination is not supported.
    NotImplemented(&'static str),
    /// The reply had an unexpected shape (wrong length, stray payload).
    CardExchange,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(what)
                => write!(f, "invalid argument: {}", what),
            Self::ApduEncode(e)
                => write!(f, "failed to encode APDU: {}", e),
            Self::ApduFail(status)
                => write!(f, "card error {}", status),
            Self::Transport(e)
                => write!(f, "transport error: {}", e),
            Self::Integrity
                => write!(f, "CRC/MAC verification of a response failed"),
            Self::Auth(code)
                => write!(f, "authentication error {}: {}", code, auth_error_description(*code)),
            Self::NotImplemented(what)
                => write!(f, "not implemented: {}", what),
            Self::CardExchange
                => write!(f, "unexpected reply shape from card"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidArgument(_) => None,
            Self::ApduEncode(e) => Some(e),
            Self::ApduFail(_) => None,
            Self::Transport(e) => Some(e),
            Self::Integrity => None,
            Self::Auth(_) => None,
            Self::NotImplemented(_) => None,
            Self::CardExchange => None,
        }
    }
}
impl From<WriteError> for Error {
    fn from(value: WriteError) -> Self { Self::ApduEncode(value) }
}
impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}


/// Human-readable description of a step-indexed authentication error code.
///
/// Callers are expected to consume the code; the strings are for diagnostics
/// only.
pub const fn auth_error_description(code: u16) -> &'static str {
    match code {
        1 => "sending auth command failed",
        2 => "authentication failed, no data received",
        3 => "authentication failed, invalid key number",
        4 => "authentication failed, length of answer does not match algorithm length",
        7 => "sending auth response failed",
        8 => "authentication failed, card timeout",
        9 => "authentication failed",
        11 => "authentication failed, cannot verify session key",
        100 => "no auth method for the provided channel parameters",
        200 => "cannot select application",
        201 => "authentication returned no error but channel not authenticated",
        301 => "ISO get challenge error",
        302 => "ISO get challenge returned wrong length",
        304 => "external authenticate error",
        305 => "internal authenticate error",
        306 => "internal authenticate returned wrong length",
        308 => "random numbers do not match, authentication failed",
        _ => "unknown authentication error",
    }
}


#[cfg(test)]
mod tests {
    use super::{auth_error_description, Error};
    use crate::status::Status;

    #[test]
    fn test_auth_codes_have_descriptions() {
        for code in [1, 2, 3, 4, 7, 8, 9, 11, 100, 200, 201, 301, 302, 304, 305, 306, 308] {
            assert_ne!(auth_error_description(code), "unknown authentication error");
        }
        assert_eq!(auth_error_description(999), "unknown authentication error");
    }

    #[test]
    fn test_display() {
        let e = Error::ApduFail(Status::AuthenticationError);
        assert!(e.to_string().contains("0xAE"));
        let e = Error::Auth(11);
        assert!(e.to_string().contains("session key"));
    }
}
