//! Session cookie signing.
//!
//! Wire format: `<session_id>|<lowercase hex HMAC-SHA256(secret, session_id)>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieError {
    #[error("malformed cookie")]
    Malformed,

    #[error("invalid cookie signature")]
    BadSignature,
}

fn mac_for(session_id: &str, secret: &[u8]) -> HmacSha256 {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can accept any key length");
    mac.update(session_id.as_bytes());
    mac
}

/// Signs a session id. The id must not contain `|`.
pub fn sign(session_id: &str, secret: &[u8]) -> String {
    let digest = mac_for(session_id, secret).finalize().into_bytes();
    format!("{session_id}{SEPARATOR}{}", hex::encode(digest))
}

/// Returns the session id if `token` carries a valid signature for `secret`.
pub fn verify<'a>(token: &'a str, secret: &[u8]) -> Result<&'a str, CookieError> {
    let mut parts = token.split(SEPARATOR);
    let (Some(session_id), Some(signature), None) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CookieError::Malformed);
    };
    // Uppercase hex would decode fine but is not the wire format.
    if signature.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(CookieError::BadSignature);
    }
    let signature = hex::decode(signature).map_err(|_| CookieError::BadSignature)?;
    mac_for(session_id, secret)
        .verify_slice(&signature)
        .map_err(|_| CookieError::BadSignature)?;
    Ok(session_id)
}
