//! obs-websocket v5 authentication string.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

/// Computes the `authentication` field of the Identify message:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{}{}", password, salt).as_bytes()));
    BASE64.encode(Sha256::digest(format!("{}{}", secret, challenge).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_documentation_vector() {
        let response = auth_response(
            "supersecretpassword",
            "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=",
            "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=",
        );
        assert_eq!(response, "1Ct943GAT+6YQUUX47Ia/ncufilbe6+oD6lY+5kaCu4=");
    }

    #[test]
    fn test_password_changes_response() {
        assert_ne!(
            auth_response("a", "salt", "challenge"),
            auth_response("b", "salt", "challenge")
        );
    }
}
