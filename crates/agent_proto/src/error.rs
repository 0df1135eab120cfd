use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] agent_crypto::CryptoError),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unsupported agent version: {0}")]
    UnsupportedVersion(u16),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
