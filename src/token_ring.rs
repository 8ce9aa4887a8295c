use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub label: String,
    pub expired: bool,
    pub reason: Option<String>,
}

impl Token {
    fn new(value: String, label: String) -> Self {
        Self { value, label, expired: false, reason: None }
    }

    /// `first4****last4`, used in every log line that mentions a token (spec.md §4.1).
    pub fn masked(&self) -> String {
        let v = &self.value;
        if v.len() <= 8 {
            "****".to_string()
        } else {
            format!("{}****{}", &v[..4], &v[v.len() - 4..])
        }
    }
}

struct Inner {
    tokens: Vec<Token>,
    cursor: usize,
}

/// Rotates among N API keys; marks tokens expired/recovered (spec.md §4.1).
/// Single mutex guards all mutation (spec.md §5).
pub struct TokenRing {
    inner: Mutex<Inner>,
}

impl TokenRing {
    pub fn new(primary: String, additional: Vec<String>) -> Self {
        let mut tokens = vec![Token::new(primary, "primary".to_string())];
        for (i, key) in additional.into_iter().enumerate() {
            tokens.push(Token::new(key, format!("additional-{}", i + 1)));
        }
        Self { inner: Mutex::new(Inner { tokens, cursor: 0 }) }
    }

    /// Returns the first non-expired token, advancing the cursor cyclically.
    pub fn current(&self) -> Result<Token> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.tokens.len();
        for step in 0..n {
            let idx = (inner.cursor + step) % n;
            if !inner.tokens[idx].expired {
                inner.cursor = (idx + 1) % n;
                return Ok(inner.tokens[idx].clone());
            }
        }
        Err(CoreError::AllTokensExpired)
    }

    pub fn mark_expired(&self, value: &str, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.tokens.iter_mut().find(|t| t.value == value) {
            if !t.expired {
                warn!(token = %t.masked(), %reason, "marking token expired");
            }
            t.expired = true;
            t.reason = Some(reason.to_string());
        }
    }

    pub fn mark_recovered(&self, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.tokens.iter_mut().find(|t| t.value == value) {
            if t.expired {
                info!(token = %t.masked(), "token recovered");
            }
            t.expired = false;
            t.reason = None;
        }
    }

    /// Clears expiry on every token (daily reset, spec.md §4.8).
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for t in inner.tokens.iter_mut() {
            t.expired = false;
            t.reason = None;
        }
        info!("token ring reset: all tokens cleared");
    }

    pub fn expired_count(&self) -> usize {
        self.inner.lock().unwrap().tokens.iter().filter(|t| t.expired).count()
    }

    pub fn expired_tokens(&self) -> Vec<Token> {
        self.inner.lock().unwrap().tokens.iter().filter(|t| t.expired).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_rotates_cyclically() {
        let ring = TokenRing::new("a".into(), vec!["b".into()]);
        let first = ring.current().unwrap();
        let second = ring.current().unwrap();
        assert_ne!(first.value, second.value);
        let third = ring.current().unwrap();
        assert_eq!(third.value, first.value);
    }

    #[test]
    fn all_expired_returns_error() {
        let ring = TokenRing::new("a".into(), vec![]);
        ring.mark_expired("a", "bandwidth");
        assert!(matches!(ring.current(), Err(CoreError::AllTokensExpired)));
    }

    #[test]
    fn expired_with_bandwidth_reason_never_returned_until_reset_or_recovery() {
        let ring = TokenRing::new("a".into(), vec!["b".into()]);
        ring.mark_expired("a", "bandwidth");
        for _ in 0..10 {
            let t = ring.current().unwrap();
            assert_eq!(t.value, "b");
        }
        ring.reset_all();
        let mut seen_a = false;
        for _ in 0..4 {
            if ring.current().unwrap().value == "a" {
                seen_a = true;
            }
        }
        assert!(seen_a);
    }

    #[test]
    fn mark_recovered_is_idempotent() {
        let ring = TokenRing::new("a".into(), vec![]);
        ring.mark_expired("a", "bandwidth");
        ring.mark_recovered("a");
        ring.mark_recovered("a");
        assert_eq!(ring.expired_count(), 0);
    }

    #[test]
    fn masked_representation_hides_middle() {
        let t = Token::new("abcdefgh1234".into(), "primary".into());
        assert_eq!(t.masked(), "abcd****1234");
    }
}
