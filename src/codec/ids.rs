//! Random identifiers: request ids and daemon auth tokens

use crate::error::{AskError, Result};

/// 128-bit request id as 32 lowercase hex chars
pub fn new_request_id() -> String {
    match random_bytes::<16>() {
        Ok(bytes) => hex_encode(&bytes),
        Err(e) => {
            // ids only need to be unique, not secret
            tracing::warn!(error = %e, "OS RNG unavailable, falling back to time-derived id");
            time_derived_hex(32)
        }
    }
}

/// 256-bit auth token as 64 lowercase hex chars.
///
/// Fails when the OS random source is unavailable; a guessable token would
/// let any local process drive the daemon.
pub fn new_token() -> Result<String> {
    random_bytes::<32>()
        .map(|bytes| hex_encode(&bytes))
        .map_err(|e| AskError::backend(format!("cannot generate auth token: {}", e)))
}

fn random_bytes<const N: usize>() -> std::result::Result<[u8; N], getrandom::Error> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes)
}

fn time_derived_hex(len: usize) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id() as u128;
    let mixed = nanos ^ pid.rotate_left(17);
    let mut out = hex_encode(&mixed.to_le_bytes());
    while out.len() < len {
        out.push_str(&hex_encode(&mixed.rotate_left(out.len() as u32).to_le_bytes()));
    }
    out.truncate(len);
    out
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
