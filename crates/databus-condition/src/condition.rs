//! Condition tree, evaluation and canonical rendering.

use std::fmt;

/// A string pattern where `*` matches any (possibly empty) run of characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `value` matches this pattern.
    pub fn matches(&self, value: &str) -> bool {
        let mut parts = self.0.split('*');
        // split always yields at least one element
        let first = parts.next().unwrap_or_default();
        let Some(mut rest) = value.strip_prefix(first) else {
            return false;
        };

        let tail: Vec<&str> = parts.collect();
        let Some((last, middle)) = tail.split_last() else {
            // No wildcard: exact match.
            return rest.is_empty();
        };

        for segment in middle {
            match rest.find(segment) {
                Some(idx) => rest = &rest[idx + segment.len()..],
                None => return false,
            }
        }

        rest.len() >= last.len() && rest.ends_with(last)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.0.chars() {
            if c == '"' || c == '\\' {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str("\"")
    }
}

/// A parsed table filter condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    AlwaysTrue,
    AlwaysFalse,
    Table(Vec<Pattern>),
    Key(Vec<Pattern>),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Evaluates the condition against a mutated row.
    pub fn matches(&self, table: &str, key: &str) -> bool {
        match self {
            Self::AlwaysTrue => true,
            Self::AlwaysFalse => false,
            Self::Table(patterns) => patterns.iter().any(|p| p.matches(table)),
            Self::Key(patterns) => patterns.iter().any(|p| p.matches(key)),
            Self::Not(inner) => !inner.matches(table, key),
            Self::And(all) => all.iter().all(|c| c.matches(table, key)),
            Self::Or(any) => any.iter().any(|c| c.matches(table, key)),
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::AlwaysTrue
    }
}

impl std::str::FromStr for Condition {
    type Err = crate::ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parse(s)
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, items: &[T]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysTrue => f.write_str("alwaysTrue()"),
            Self::AlwaysFalse => f.write_str("alwaysFalse()"),
            Self::Table(patterns) => write_list(f, "table", patterns),
            Self::Key(patterns) => write_list(f, "key", patterns),
            Self::Not(inner) => write!(f, "not({inner})"),
            Self::And(all) => write_list(f, "and", all),
            Self::Or(any) => write_list(f, "or", any),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_without_wildcard_is_exact() {
        let p = Pattern::new("review");
        assert!(p.matches("review"));
        assert!(!p.matches("reviews"));
        assert!(!p.matches("revie"));
    }

    #[test]
    fn pattern_wildcards() {
        assert!(Pattern::new("*").matches(""));
        assert!(Pattern::new("*").matches("anything"));
        assert!(Pattern::new("review:*").matches("review:en_US"));
        assert!(!Pattern::new("review:*").matches("answer:en_US"));
        assert!(Pattern::new("*:en_US").matches("review:en_US"));
        assert!(Pattern::new("a*b*c").matches("a-x-b-y-c"));
        assert!(!Pattern::new("a*b*c").matches("a-x-c"));
        // The suffix must not overlap the prefix.
        assert!(!Pattern::new("ab*ba").matches("aba"));
    }

    #[test]
    fn composite_conditions() {
        let c = Condition::And(vec![
            Condition::Table(vec![Pattern::new("review*")]),
            Condition::Not(Box::new(Condition::Key(vec![Pattern::new("test-*")]))),
        ]);
        assert!(c.matches("review:en_US", "r-1"));
        assert!(!c.matches("review:en_US", "test-1"));
        assert!(!c.matches("answer", "r-1"));

        assert!(!Condition::Or(vec![]).matches("t", "k"));
        assert!(Condition::And(vec![]).matches("t", "k"));
    }

    #[test]
    fn display_escapes_quotes() {
        let c = Condition::Key(vec![Pattern::new(r#"a"b\c"#)]);
        assert_eq!(c.to_string(), r#"key("a\"b\\c")"#);
    }
}
