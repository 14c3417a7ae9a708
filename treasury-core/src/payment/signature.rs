//! Gateway notification signatures
//!
//! `signature_key = hex(SHA-512(order_id || status_code || gross_amount || server_key))`,
//! compared case-sensitively.

use sha2::{Digest, Sha512};

/// Expected signature for a notification
pub fn notification_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `supplied` is the signature the gateway would have produced
pub fn verify_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
    supplied: &str,
) -> bool {
    notification_signature(order_id, status_code, gross_amount, server_key) == supplied
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &str = "d62a657fce09d29231dda6a43bf163cb1aca5f93a85349837d323a6f7bae40ff0f508aa3a866bf7ad534a0fd0f979e45cb235283f90a10af0656bdd9f7f0cb8c";

    #[test]
    fn test_known_vector() {
        let sig = notification_signature(
            "MKG-org123-1700000000000",
            "200",
            "50000.00",
            "SB-Mid-server-secret",
        );
        assert_eq!(sig, KNOWN);
    }

    #[test]
    fn test_verify_is_case_sensitive() {
        let args = ("MKG-org123-1700000000000", "200", "50000.00", "SB-Mid-server-secret");
        assert!(verify_signature(args.0, args.1, args.2, args.3, KNOWN));
        assert!(!verify_signature(args.0, args.1, args.2, args.3, &KNOWN.to_uppercase()));
        assert!(!verify_signature(args.0, args.1, "50000", args.3, KNOWN));
    }
}
