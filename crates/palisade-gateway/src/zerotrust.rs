//! The zero-trust filter for chat-originated commands.

use palisade_config::ZeroTrustSection;

/// Compiled authorization policy.
///
/// An empty trusted-sender set means the filter is disabled entirely; a
/// non-empty set denies by default.
#[derive(Debug, Clone)]
pub struct ZeroTrustPolicy {
    trusted_senders: Vec<SenderPattern>,
    trusted_rooms: Vec<String>,
    /// Whether rejections produce a notice back to the originating room.
    pub reject_untrusted: bool,
}

#[derive(Debug, Clone)]
enum SenderPattern {
    /// Full sender id (`@alice:example.org`).
    Exact(String),
    /// `*` followed by a suffix: `*@domain` or `*:homeserver`.
    Suffix(String),
}

impl SenderPattern {
    fn parse(pattern: &str) -> Self {
        pattern.strip_prefix('*').map_or_else(
            || Self::Exact(pattern.to_owned()),
            |suffix| Self::Suffix(suffix.to_owned()),
        )
    }

    fn matches(&self, sender: &str) -> bool {
        match self {
            Self::Exact(exact) => sender == exact,
            Self::Suffix(suffix) => sender.ends_with(suffix.as_str()),
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The command may be dispatched.
    Allowed,
    /// The sender is not in the trusted set.
    UntrustedSender,
    /// The room is not in the trusted set.
    UntrustedRoom,
}

impl PolicyDecision {
    /// Whether dispatch may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Short reason string for audit entries.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::UntrustedSender => "sender not trusted",
            Self::UntrustedRoom => "room not trusted",
        }
    }
}

impl ZeroTrustPolicy {
    /// Compile the policy from configuration.
    #[must_use]
    pub fn from_config(section: &ZeroTrustSection) -> Self {
        Self {
            trusted_senders: section
                .trusted_senders
                .iter()
                .map(|p| SenderPattern::parse(p))
                .collect(),
            trusted_rooms: section.trusted_rooms.clone(),
            reject_untrusted: section.reject_untrusted,
        }
    }

    /// Whether the filter is active at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.trusted_senders.is_empty()
    }

    /// Check a chat-originated command.
    #[must_use]
    pub fn check(&self, sender: &str, room_id: &str) -> PolicyDecision {
        if !self.is_enabled() {
            return PolicyDecision::Allowed;
        }
        if !self.trusted_senders.iter().any(|p| p.matches(sender)) {
            return PolicyDecision::UntrustedSender;
        }
        if !self.trusted_rooms.is_empty() && !self.trusted_rooms.iter().any(|r| r == room_id) {
            return PolicyDecision::UntrustedRoom;
        }
        PolicyDecision::Allowed
    }

    /// Whether `sender` alone passes the sender patterns (used for the
    /// invite filter, where no room applies yet).
    #[must_use]
    pub fn sender_trusted(&self, sender: &str) -> bool {
        !self.is_enabled() || self.trusted_senders.iter().any(|p| p.matches(sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(senders: &[&str], rooms: &[&str], reject: bool) -> ZeroTrustPolicy {
        ZeroTrustPolicy::from_config(&ZeroTrustSection {
            trusted_senders: senders.iter().map(|s| (*s).to_owned()).collect(),
            trusted_rooms: rooms.iter().map(|s| (*s).to_owned()).collect(),
            reject_untrusted: reject,
        })
    }

    #[test]
    fn test_empty_policy_allows_everyone() {
        let p = policy(&[], &[], true);
        assert!(!p.is_enabled());
        assert_eq!(p.check("@mallory:ex", "!any:ex"), PolicyDecision::Allowed);
    }

    #[test]
    fn test_exact_sender() {
        let p = policy(&["@alice:ex"], &[], true);
        assert_eq!(p.check("@alice:ex", "!r:ex"), PolicyDecision::Allowed);
        assert_eq!(p.check("@mallory:ex", "!r:ex"), PolicyDecision::UntrustedSender);
    }

    #[test]
    fn test_homeserver_wildcard() {
        let p = policy(&["*:trusted.org"], &[], true);
        assert_eq!(p.check("@anyone:trusted.org", "!r:ex"), PolicyDecision::Allowed);
        assert_eq!(p.check("@anyone:evil.org", "!r:ex"), PolicyDecision::UntrustedSender);
    }

    #[test]
    fn test_domain_wildcard() {
        let p = policy(&["*@ops"], &[], true);
        assert_eq!(p.check("team@ops", "!r:ex"), PolicyDecision::Allowed);
        assert_eq!(p.check("team@dev", "!r:ex"), PolicyDecision::UntrustedSender);
    }

    #[test]
    fn test_room_restriction() {
        let p = policy(&["@alice:ex"], &["!ops:ex"], true);
        assert_eq!(p.check("@alice:ex", "!ops:ex"), PolicyDecision::Allowed);
        assert_eq!(p.check("@alice:ex", "!random:ex"), PolicyDecision::UntrustedRoom);
    }

    #[test]
    fn test_empty_rooms_means_any_room() {
        let p = policy(&["@alice:ex"], &[], true);
        assert_eq!(p.check("@alice:ex", "!whatever:ex"), PolicyDecision::Allowed);
    }

    #[test]
    fn test_sender_trusted_helper() {
        let p = policy(&["@alice:ex"], &["!ops:ex"], true);
        assert!(p.sender_trusted("@alice:ex"));
        assert!(!p.sender_trusted("@mallory:ex"));

        let disabled = policy(&[], &[], false);
        assert!(disabled.sender_trusted("@anyone:ex"));
    }
}
