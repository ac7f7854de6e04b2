//! Recursive-descent parser for condition text.

use crate::condition::{Condition, Pattern};
use thiserror::Error;

/// Errors produced while parsing condition text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("unexpected end of condition at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected character '{found}' at offset {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: char,
        expected: &'static str,
    },
    #[error("unknown condition function '{0}'")]
    UnknownFunction(String),
    #[error("'{function}' expects {expected}")]
    Arity {
        function: String,
        expected: &'static str,
    },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("trailing input at offset {0}")]
    TrailingInput(usize),
    #[error("condition nested deeper than {max} levels at offset {0}", max = MAX_DEPTH)]
    TooDeep(usize),
}

/// Deepest function nesting accepted by [`parse`].
pub const MAX_DEPTH: usize = 64;

/// Parses condition text. Empty (or all-whitespace) text means
/// [`Condition::AlwaysTrue`].
///
/// # Errors
///
/// Returns `ConditionError` describing the first syntax problem found.
pub fn parse(text: &str) -> Result<Condition, ConditionError> {
    if text.trim().is_empty() {
        return Ok(Condition::AlwaysTrue);
    }

    let mut parser = Parser {
        src: text,
        pos: 0,
        depth: 0,
    };
    let condition = parser.condition()?;
    parser.skip_ws();
    if parser.pos < parser.src.len() {
        return Err(ConditionError::TrailingInput(parser.pos));
    }
    Ok(condition)
}

enum Arg {
    Str(String),
    Cond(Condition),
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char, expected: &'static str) -> Result<(), ConditionError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(found) => Err(ConditionError::Unexpected {
                offset: self.pos - found.len_utf8(),
                found,
                expected,
            }),
            None => Err(ConditionError::UnexpectedEnd(self.pos)),
        }
    }

    fn ident(&mut self) -> Result<&'a str, ConditionError> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.bump();
        }
        if start == self.pos {
            return match self.peek() {
                Some(found) => Err(ConditionError::Unexpected {
                    offset: start,
                    found,
                    expected: "a condition function name",
                }),
                None => Err(ConditionError::UnexpectedEnd(start)),
            };
        }
        let src = self.src;
        Ok(&src[start..self.pos])
    }

    fn string(&mut self) -> Result<String, ConditionError> {
        let start = self.pos;
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(ConditionError::UnterminatedString(start)),
                },
                Some(c) => out.push(c),
                None => return Err(ConditionError::UnterminatedString(start)),
            }
        }
    }

    fn condition(&mut self) -> Result<Condition, ConditionError> {
        let name = self.ident()?;
        self.expect('(', "'('")?;
        if self.depth >= MAX_DEPTH {
            return Err(ConditionError::TooDeep(self.pos));
        }
        self.depth += 1;
        let args = self.args()?;
        self.depth -= 1;

        let conditions = |args: Vec<Arg>| -> Result<Vec<Condition>, ConditionError> {
            args.into_iter()
                .map(|a| match a {
                    Arg::Cond(c) => Ok(c),
                    Arg::Str(_) => Err(ConditionError::Arity {
                        function: name.to_string(),
                        expected: "condition arguments",
                    }),
                })
                .collect()
        };
        let patterns = |args: Vec<Arg>| -> Result<Vec<Pattern>, ConditionError> {
            if args.is_empty() {
                return Err(ConditionError::Arity {
                    function: name.to_string(),
                    expected: "at least one string pattern",
                });
            }
            args.into_iter()
                .map(|a| match a {
                    Arg::Str(s) => Ok(Pattern::new(s)),
                    Arg::Cond(_) => Err(ConditionError::Arity {
                        function: name.to_string(),
                        expected: "string patterns",
                    }),
                })
                .collect()
        };

        match name {
            "alwaysTrue" | "alwaysFalse" => {
                if !args.is_empty() {
                    return Err(ConditionError::Arity {
                        function: name.to_string(),
                        expected: "no arguments",
                    });
                }
                Ok(if name == "alwaysTrue" {
                    Condition::AlwaysTrue
                } else {
                    Condition::AlwaysFalse
                })
            }
            "table" => Ok(Condition::Table(patterns(args)?)),
            "key" => Ok(Condition::Key(patterns(args)?)),
            "not" => {
                let mut inner = conditions(args)?;
                if inner.len() != 1 {
                    return Err(ConditionError::Arity {
                        function: name.to_string(),
                        expected: "exactly one condition",
                    });
                }
                Ok(Condition::Not(Box::new(inner.remove(0))))
            }
            "and" => Ok(Condition::And(conditions(args)?)),
            "or" => Ok(Condition::Or(conditions(args)?)),
            other => Err(ConditionError::UnknownFunction(other.to_string())),
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, ConditionError> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.bump();
            return Ok(args);
        }

        loop {
            self.skip_ws();
            let arg = match self.peek() {
                Some('"') => Arg::Str(self.string()?),
                Some(_) => Arg::Cond(self.condition()?),
                None => return Err(ConditionError::UnexpectedEnd(self.pos)),
            };
            args.push(arg);

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(')') => return Ok(args),
                Some(found) => {
                    return Err(ConditionError::Unexpected {
                        offset: self.pos - found.len_utf8(),
                        found,
                        expected: "',' or ')'",
                    })
                }
                None => return Err(ConditionError::UnexpectedEnd(self.pos)),
            }
        }
    }
}
