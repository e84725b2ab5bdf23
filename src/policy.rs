//! The immutable policy snapshot and the authorization check, §3/§4.2.

use std::collections::HashSet;

use crate::request::RequestHead;

/// Immutable, shared read-only across every session once the server starts.
/// Built once by `config::load_policy_files` and handed to every accepted
/// connection behind an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct Policy {
    pub auth_enabled: bool,
    pub tokens: HashSet<String>,
    pub banned_hosts: HashSet<String>,
}

impl Policy {
    pub fn new(auth_enabled: bool, tokens: HashSet<String>, banned_hosts: HashSet<String>) -> Self {
        Self {
            auth_enabled,
            tokens,
            banned_hosts,
        }
    }

    /// Exact-match host ban check. No suffix/pattern matching, per §3.
    pub fn is_banned(&self, host: &str) -> bool {
        self.banned_hosts.contains(host)
    }
}

/// Result of running [`authorize`] against a parsed head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Unauthorized,
}

/// `check(head, policy)` from §4.2: exact-byte token comparison, no prefix
/// stripping. When auth is disabled every request is authorized.
pub fn authorize(head: &RequestHead, policy: &Policy) -> AuthOutcome {
    if !policy.auth_enabled {
        return AuthOutcome::Ok;
    }

    match &head.token {
        Some(token) if policy.tokens.contains(token) => AuthOutcome::Ok,
        _ => AuthOutcome::Unauthorized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestHead;

    fn head_with_token(token: Option<&str>) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: "http://example.test/".to_string(),
            remote_host: "example.test".to_string(),
            remote_port: 80,
            headers: Vec::new(),
            token: token.map(str::to_string),
            keep_alive: false,
            raw_lines: Vec::new(),
        }
    }

    #[test]
    fn auth_disabled_always_ok() {
        let policy = Policy::new(false, HashSet::new(), HashSet::new());
        assert_eq!(authorize(&head_with_token(None), &policy), AuthOutcome::Ok);
    }

    #[test]
    fn auth_enabled_requires_matching_token() {
        let mut tokens = HashSet::new();
        tokens.insert("123".to_string());
        let policy = Policy::new(true, tokens, HashSet::new());

        assert_eq!(
            authorize(&head_with_token(Some("123")), &policy),
            AuthOutcome::Ok
        );
        assert_eq!(
            authorize(&head_with_token(Some("bad-key")), &policy),
            AuthOutcome::Unauthorized
        );
        assert_eq!(
            authorize(&head_with_token(None), &policy),
            AuthOutcome::Unauthorized
        );
    }

    #[test]
    fn no_bearer_prefix_stripping() {
        let mut tokens = HashSet::new();
        tokens.insert("123".to_string());
        let policy = Policy::new(true, tokens, HashSet::new());

        // "Bearer 123" must not match a stored token of "123".
        assert_eq!(
            authorize(&head_with_token(Some("Bearer 123")), &policy),
            AuthOutcome::Unauthorized
        );
    }

    #[test]
    fn banned_hosts_are_exact_match_only() {
        let mut banned = HashSet::new();
        banned.insert("mathprofi.ru".to_string());
        let policy = Policy::new(false, HashSet::new(), banned);

        assert!(policy.is_banned("mathprofi.ru"));
        assert!(!policy.is_banned("sub.mathprofi.ru"));
        assert!(!policy.is_banned("mathprofi.ru.evil.test"));
    }
}
