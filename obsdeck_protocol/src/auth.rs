use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Computes the `authentication` string sent in the identify message.
///
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn authentication_response(password: &str, salt: &str, challenge: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let secret = STANDARD.encode(hasher.finalize());

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(challenge.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vector() {
        let got = authentication_response(
            "supersecretpassword",
            "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=",
            "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=",
        );
        assert_eq!(got, "1Ct943GAT+6YQUUX47Ia/ncufilbe6+oD6lY+5kaCu4=");
    }

    #[test]
    fn is_deterministic() {
        let a = authentication_response("hunter2", "salt", "challenge");
        let b = authentication_response("hunter2", "salt", "challenge");
        assert_eq!(a, b);
        assert_eq!(a, "6wBfUL6veUkD5SNgIOr1TMt9f7OxcqAbus2+WDaJbAg=");
        assert_ne!(a, authentication_response("hunter2", "salt", "other"));
    }
}
