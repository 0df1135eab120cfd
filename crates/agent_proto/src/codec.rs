//! Wire codec — padding and framing for the two plaintexts the protocol
//! ever pads (§4.2): `AgentConnInfo`/`AgentConnInfoReply` bodies padded to
//! `e2e_enc_conn_info_length`, and `AgentMessage` bodies padded to
//! `e2e_enc_user_msg_length`. Unlike a bucket ladder, the target length is
//! fixed per envelope kind, not chosen from the plaintext's own size —
//! callers that exceed the configured length get a hard error rather than
//! silently falling back to an unpadded length, since that would leak size.

use serde::{Deserialize, Serialize};

/// Which of the two protocol-fixed lengths a plaintext pads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddedKind {
    ConnInfo,
    UserMessage,
}

/// Format: `[original_len: u32 LE] [plaintext] [random padding]`.
/// The length prefix makes unpadding after decryption unambiguous.
pub fn pad_to_length(plaintext: &[u8], target_len: usize) -> Result<Vec<u8>, CodecError> {
    let needed = 4 + plaintext.len();
    if needed > target_len {
        return Err(CodecError::InvalidPadding(format!(
            "plaintext of {} bytes does not fit the fixed length {target_len}",
            plaintext.len()
        )));
    }
    let mut out = Vec::with_capacity(target_len);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    let remaining = target_len - out.len();
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    Ok(out)
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

/// Encode a message for the wire: serialize → pad to `target_len` → ready
/// for AEAD encryption.
pub fn encode_for_wire(payload_json: &[u8], target_len: usize) -> Result<Vec<u8>, CodecError> {
    pad_to_length(payload_json, target_len)
}

/// Decode a message from the wire: AEAD-decrypted bytes → unpad → JSON payload.
pub fn decode_from_wire(padded_plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    unpad(padded_plaintext)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_unpad_roundtrip() {
        let msg = b"Hello, World!";
        let padded = pad_to_length(msg, 256).unwrap();
        assert_eq!(padded.len(), 256);
        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, msg);
    }

    #[test]
    fn pad_rejects_oversized_plaintext() {
        let msg = vec![0x42u8; 5000];
        assert!(pad_to_length(&msg, 256).is_err());
    }

    #[test]
    fn conn_info_and_user_msg_lengths_are_distinct() {
        let conn_info = pad_to_length(b"conn-info", 512).unwrap();
        let user_msg = pad_to_length(b"a-msg", 16384).unwrap();
        assert_ne!(conn_info.len(), user_msg.len());
    }
}
