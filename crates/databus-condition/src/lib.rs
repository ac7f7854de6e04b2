//! Table filter conditions for databus subscriptions.
//!
//! A condition is parsed once, when a subscription is created or refreshed,
//! and then evaluated against every mutation the bus fans out. Evaluation is
//! pure: it looks only at the mutated row's table name and key.
//!
//! # Syntax
//!
//! | Form | Matches |
//! |------|---------|
//! | `alwaysTrue()` | every mutation (also the meaning of empty text) |
//! | `alwaysFalse()` | nothing |
//! | `table("review", "answer:*")` | table equal to any pattern |
//! | `key("r-1", "r-2*")` | row key equal to any pattern |
//! | `not(c)` | mutations `c` rejects |
//! | `and(c1, c2, ...)` | mutations every `ci` accepts |
//! | `or(c1, c2, ...)` | mutations any `ci` accepts |
//!
//! Patterns are string literals in which `*` matches any run of characters.
//! Functions may nest at most [`MAX_DEPTH`] levels deep.
//!
//! ```rust
//! use databus_condition::Condition;
//!
//! let c: Condition = r#"and(table("review*"), not(key("test-*")))"#.parse().unwrap();
//! assert!(c.matches("review:en_US", "r-1"));
//! assert!(!c.matches("review:en_US", "test-7"));
//! ```

mod condition;
mod parser;

pub use condition::{Condition, Pattern};
pub use parser::{parse, ConditionError, MAX_DEPTH};
