//! Topic filter matching
//!
//! Pure functions comparing concrete broker topics against subscription
//! filters that may contain `+` (one level) and `#` (remaining levels).

/// Single-level wildcard segment
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard segment, only meaningful as the final segment
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Pure topic matching decisions
pub struct TopicMatcher;

impl TopicMatcher {
    /// Match `topic` against the subscription `pattern`.
    ///
    /// Segments are compared in lock-step. `#` matches everything that
    /// remains, including nothing at all, so `a/#` matches `a`. `+` consumes
    /// exactly one segment and never crosses a `/`.
    pub fn matches(topic: &str, pattern: &str) -> bool {
        let mut topic_levels = topic.split('/');
        let mut pattern_levels = pattern.split('/');

        loop {
            match (pattern_levels.next(), topic_levels.next()) {
                (Some(MULTI_LEVEL_WILDCARD), _) => return true,
                (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
                (Some(expected), Some(actual)) if expected == actual => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// True when the pattern contains wildcard characters
    pub fn is_wildcard(pattern: &str) -> bool {
        pattern.contains('+') || pattern.contains('#')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(TopicMatcher::matches("a/b/c", "a/+/c"));
        assert!(!TopicMatcher::matches("a/b", "a/+/c"));
        assert!(!TopicMatcher::matches("a/b/c", "a/+"));
        assert!(!TopicMatcher::matches("a/b/x/c", "a/+/c"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(TopicMatcher::matches("a/b/c", "a/#"));
        assert!(TopicMatcher::matches("a/b", "a/#"));
        assert!(TopicMatcher::matches("anything/at/all", "#"));
        assert!(!TopicMatcher::matches("b/c", "a/#"));
    }

    #[test]
    fn test_multi_level_wildcard_matches_parent() {
        assert!(TopicMatcher::matches("a", "a/#"));
        assert!(TopicMatcher::matches("yan/control", "yan/control/#"));
    }

    #[test]
    fn test_exact_match_requires_equal_length() {
        assert!(TopicMatcher::matches("a/b", "a/b"));
        assert!(!TopicMatcher::matches("a/b/c", "a/b"));
        assert!(!TopicMatcher::matches("a/b", "a/b/c"));
        assert!(!TopicMatcher::matches("a/B", "a/b"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(TopicMatcher::matches("yan/control/show/1", "yan/+/show/#"));
        assert!(TopicMatcher::matches("yan/x/show", "yan/+/show/#"));
        assert!(!TopicMatcher::matches("yan/x/hide/1", "yan/+/show/#"));
    }

    #[test]
    fn test_empty_segments_are_ordinary() {
        assert!(TopicMatcher::matches("a//c", "a/+/c"));
        assert!(TopicMatcher::matches("/status", "/status"));
        assert!(!TopicMatcher::matches("status", "/status"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(TopicMatcher::is_wildcard("a/+/c"));
        assert!(TopicMatcher::is_wildcard("a/#"));
        assert!(!TopicMatcher::is_wildcard("a/b/c"));
        assert!(!TopicMatcher::is_wildcard(""));
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in prop::collection::vec("[a-z0-9_]{1,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(TopicMatcher::matches(&topic, &topic));
        }

        #[test]
        fn prop_hash_matches_everything(topic in "[a-z/]{0,30}") {
            prop_assert!(TopicMatcher::matches(&topic, "#"));
        }

        #[test]
        fn prop_plus_replaces_any_single_level(
            levels in prop::collection::vec("[a-z0-9_]{1,8}", 1..6),
            index in 0usize..6,
        ) {
            let index = index % levels.len();
            let topic = levels.join("/");
            let mut pattern_levels: Vec<&str> = levels.iter().map(String::as_str).collect();
            pattern_levels[index] = "+";
            prop_assert!(TopicMatcher::matches(&topic, &pattern_levels.join("/")));
        }

        #[test]
        fn prop_plus_never_spans_levels(
            prefix in "[a-z]{1,6}",
            first in "[a-z]{1,6}",
            second in "[a-z]{1,6}",
        ) {
            let topic = format!("{prefix}/{first}/{second}");
            let pattern = format!("{prefix}/+");
            prop_assert!(!TopicMatcher::matches(&topic, &pattern));
        }
    }
}
