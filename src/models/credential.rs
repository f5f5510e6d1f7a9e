use chrono::{DateTime, Duration, Utc};

/// Bearer token issued by the token endpoint, valid until `expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from an `expires_in` value given in seconds from `issued_at`.
    /// Lifetimes past the representable range never expire.
    pub fn issued(token: String, expires_in_secs: f64, issued_at: DateTime<Utc>) -> Self {
        let millis = (expires_in_secs.max(0.0) * 1000.0) as i64;
        let expires_at = Duration::try_milliseconds(millis)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { token, expires_at }
    }

    /// Stale once the clock reaches the expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_valid_until_expiry() {
        let issued_at = Utc::now();
        let credential = Credential::issued("tok".to_string(), 3.0, issued_at);

        assert!(!credential.is_expired_at(issued_at));
        assert!(!credential.is_expired_at(issued_at + Duration::seconds(1)));
        assert!(credential.is_expired_at(issued_at + Duration::seconds(3)));
        assert!(credential.is_expired_at(issued_at + Duration::seconds(4)));
    }

    #[test]
    fn test_fractional_expiry() {
        let issued_at = Utc::now();
        let credential = Credential::issued("tok".to_string(), 1.5, issued_at);
        assert!(!credential.is_expired_at(issued_at + Duration::milliseconds(1499)));
        assert!(credential.is_expired_at(issued_at + Duration::milliseconds(1500)));
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let issued_at = Utc::now();
        for expires_in in [1e300, f64::INFINITY, 9.3e15] {
            let credential = Credential::issued("tok".to_string(), expires_in, issued_at);
            assert_eq!(credential.expires_at, DateTime::<Utc>::MAX_UTC);
            assert!(!credential.is_expired_at(issued_at + Duration::days(365 * 1000)));
        }
    }

    #[test]
    fn test_zero_or_negative_lifetime_is_already_stale() {
        let issued_at = Utc::now();
        assert!(Credential::issued("a".to_string(), 0.0, issued_at).is_expired_at(issued_at));
        assert!(Credential::issued("b".to_string(), -5.0, issued_at).is_expired_at(issued_at));
    }
}
