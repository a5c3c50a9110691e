use std::error::Error;
use std::fmt::Display;

/// Reasons a presented webhook token is refused before it is even compared
#[derive(Clone, Debug, PartialEq)]
pub enum InvalidTokenReason {
    Empty,
    TooLong,
    NotAscii,
    NullByte,
}

impl InvalidTokenReason {
    pub fn reason(&self) -> &str {
        match *self {
            Self::Empty => "empty",
            Self::NotAscii => "not_ascii",
            Self::TooLong => "too_long",
            Self::NullByte => "null_byte",
        }
    }
}

impl Display for InvalidTokenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl Error for InvalidTokenReason {}

pub const MAX_TOKEN_LENGTH: usize = 256;

/// Check if a token is the right shape. It may still not match the configured secret.
pub fn validate_token(token: &str) -> Result<(), InvalidTokenReason> {
    if token.is_empty() {
        return Err(InvalidTokenReason::Empty);
    }

    if token.len() > MAX_TOKEN_LENGTH {
        return Err(InvalidTokenReason::TooLong);
    }

    if !token.is_ascii() {
        return Err(InvalidTokenReason::NotAscii);
    }

    // We refuse tokens with null bytes
    if token.contains('\0') {
        return Err(InvalidTokenReason::NullByte);
    }

    Ok(())
}
