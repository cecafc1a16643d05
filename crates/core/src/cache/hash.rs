//! Cache key generation.

use sha2::{Digest, Sha256};

/// Compute the cache key for a request: method plus canonical URL.
pub fn compute_request_key(method: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stability() {
        let hash1 = compute_request_key("GET", "https://taxi.example.com/");
        let hash2 = compute_request_key("get", "https://taxi.example.com/");
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_different_method() {
        let get = compute_request_key("GET", "https://taxi.example.com/cele");
        let post = compute_request_key("POST", "https://taxi.example.com/cele");
        assert_ne!(get, post);
    }

    #[test]
    fn test_hash_format() {
        let hash = compute_request_key("GET", "https://taxi.example.com/");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
