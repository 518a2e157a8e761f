//! Topic pattern matching.
//!
//! Patterns follow MQTT subscription filter rules:
//! - `+` matches exactly one level (which may be empty)
//! - `#` must be the last level and matches zero or more trailing levels,
//!   including the parent level itself (`a/#` matches `a`)
//! - Topics starting with `$` are not matched by a leading wildcard
//!
//! Every wildcard produces one capture. A `#` capture is the remaining levels
//! joined with `/`, or an empty string when there are none.

/// Whether `topic` matches `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    captures(pattern, topic).is_some()
}

/// Match `topic` against `pattern`, returning the wildcard captures in order.
pub fn captures(pattern: &str, topic: &str) -> Option<Vec<String>> {
    let normal = !topic.starts_with('$');
    let filter: Vec<&str> = pattern.split('/').collect();
    let levels: Vec<&str> = topic.split('/').collect();
    let mut captured = Vec::new();

    for (i, part) in filter.iter().enumerate() {
        match *part {
            "#" => {
                if i + 1 != filter.len() || (i == 0 && !normal) {
                    return None;
                }
                captured.push(levels.get(i..).map(|rest| rest.join("/")).unwrap_or_default());
                return Some(captured);
            }
            "+" => {
                if i == 0 && !normal {
                    return None;
                }
                captured.push(levels.get(i)?.to_string());
            }
            literal => {
                if levels.get(i) != Some(&literal) {
                    return None;
                }
            }
        }
    }

    (filter.len() == levels.len()).then_some(captured)
}

/// Whether `pattern` is a well-formed filter (`#` only last, wildcards fill a whole level).
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let parts: Vec<&str> = pattern.split('/').collect();
    parts.iter().enumerate().all(|(i, part)| match *part {
        "#" => i + 1 == parts.len(),
        "+" => true,
        literal => !literal.contains(['+', '#']),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_wildcards() {
        assert!(matches("foo/#", "foo/bar"));
        assert!(matches("+/bar", "foo/bar"));
        assert!(!matches("non/+/+", "non/matching"));
    }

    #[test]
    fn test_literal() {
        assert!(matches("foo/bar", "foo/bar"));
        assert!(!matches("foo/bar", "foo/baz"));
        assert!(!matches("foo/bar", "foo/bar/baz"));
        assert!(!matches("foo/bar/baz", "foo/bar"));
    }

    #[test]
    fn test_hash_matches_parent_and_deep_levels() {
        assert!(matches("foo/#", "foo"));
        assert!(matches("foo/#", "foo/bar/baz"));
        assert!(matches("#", "anything/at/all"));
        assert!(matches("foo/+/#", "foo/bar"));
        assert!(!matches("foo/#", "foobar"));
    }

    #[test]
    fn test_hash_must_be_last() {
        assert!(!matches("foo/#/bar", "foo/x/bar"));
        assert!(!is_valid_pattern("foo/#/bar"));
        assert!(is_valid_pattern("foo/+/#"));
        assert!(!is_valid_pattern("foo+/bar"));
    }

    #[test]
    fn test_plus_matches_empty_level() {
        assert!(matches("foo/+/bar", "foo//bar"));
        assert!(matches("+", ""));
        assert!(!matches("+", "a/b"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("#", "$SYS/broker"));
        assert!(!matches("+/broker", "$SYS/broker"));
        assert!(matches("$SYS/#", "$SYS/broker"));
    }

    #[test]
    fn test_captures() {
        assert_eq!(
            captures("client/+/ping", "client/42/ping"),
            Some(vec!["42".to_string()])
        );
        assert_eq!(
            captures("a/+/c/#", "a/b/c/d/e"),
            Some(vec!["b".to_string(), "d/e".to_string()])
        );
        assert_eq!(captures("a/#", "a"), Some(vec![String::new()]));
        assert_eq!(captures("a/b", "a/b"), Some(vec![]));
        assert_eq!(captures("a/+", "a"), None);
    }
}
