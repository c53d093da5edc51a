/// Base64 helpers kept behind one module so the crate choice stays in one
/// place.
pub mod base64 {
    pub use ::base64::DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        ::base64::decode(data)
    }
}

/// Lowercase hex rendering, used for opaque identifiers.
#[inline]
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }

    out
}
