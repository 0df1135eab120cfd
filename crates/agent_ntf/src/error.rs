use thiserror::Error;

#[derive(Debug, Error)]
pub enum NtfError {
    #[error("notification token not found: {0}")]
    TokenNotFound(String),

    #[error("illegal token transition: {from:?} -> {to:?}")]
    IllegalTransition { from: crate::token::NtfTokenState, to: crate::token::NtfTokenState },

    #[error("notification relay error: {0}")]
    Relay(String),
}
