//! Condition parser registry
//!
//! Conditions can be given as strings (task start/end conditions, the
//! configured `shut_cond`). The registry maps syntaxes to factories: a syntax
//! is a literal string or a regular expression whose named capture groups
//! become the factory's keyword arguments. On top of the registered atoms the
//! parser understands the combinator grammar `&`, `|`, `~` and parentheses.

use chrono::Duration;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use shared::time::{TimeDelta, TimePeriod};

use crate::cond_task;
use crate::conditions::{Condition, Statement, StatementKind};

/// Builds a condition from the named capture groups of a matched syntax.
pub type CondFactory =
    Arc<dyn Fn(&HashMap<String, String>) -> shared::Result<Condition> + Send + Sync>;

enum Syntax {
    Literal(String),
    Pattern(Regex),
}

pub struct ParserRegistry {
    entries: Vec<(Syntax, CondFactory)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Atom(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut buf = String::new();

    let mut flush = |buf: &mut String, tokens: &mut Vec<Token>| {
        let text = buf.trim();
        if !text.is_empty() {
            tokens.push(Token::Atom(text.to_string()));
        }
        buf.clear();
    };

    for c in input.chars() {
        match c {
            '&' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::And);
            }
            '|' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::Or);
            }
            '~' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::Not);
            }
            '(' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::Close);
            }
            _ => buf.push(c),
        }
    }
    flush(&mut buf, &mut tokens);
    tokens
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

impl ParserRegistry {
    /// An empty registry; atoms must all be registered by the caller.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry preloaded with the built-in syntaxes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_literal("true", |_| Ok(Condition::True));
        registry.register_literal("always true", |_| Ok(Condition::True));
        registry.register_literal("false", |_| Ok(Condition::False));
        registry.register_literal("always false", |_| Ok(Condition::False));

        // Current-task history atoms
        registry.register_literal("has started", |_| {
            Ok(Statement::new(StatementKind::TaskStarted { task: None }).into())
        });
        registry.register_literal("has succeeded", |_| {
            Ok(Statement::new(StatementKind::TaskSucceeded { task: None }).into())
        });
        registry.register_literal("has failed", |_| {
            Ok(Statement::new(StatementKind::TaskFailed { task: None }).into())
        });
        registry.register_literal("is running", |_| {
            Ok(Statement::new(StatementKind::TaskRunning { task: None }).into())
        });

        // Dependency atoms
        registry.register_pattern(
            Regex::new(r"after task '(?P<task>[^']+)' failed").expect("valid built-in pattern"),
            |kwargs| Ok(cond_task::depend_failure(&kwargs["task"]).into()),
        );
        registry.register_pattern(
            Regex::new(r"after task '(?P<task>[^']+)' finished").expect("valid built-in pattern"),
            |kwargs| Ok(cond_task::depend_finish(&kwargs["task"]).into()),
        );
        registry.register_pattern(
            Regex::new(r"after task '(?P<task>[^']+)'(?: succeeded)?")
                .expect("valid built-in pattern"),
            |kwargs| Ok(cond_task::depend_success(&kwargs["task"]).into()),
        );

        // Periodic executability for the current task
        registry.register_pattern(
            Regex::new(r"every (?P<num>\d+) (?P<unit>second|minute|hour|day)s?")
                .expect("valid built-in pattern"),
            |kwargs| {
                let num: i64 = kwargs["num"].parse().map_err(|e| {
                    shared::SchedulingError::CondParse(format!("Invalid interval count: {}", e))
                })?;
                let length = match kwargs["unit"].as_str() {
                    "second" => Duration::seconds(num),
                    "minute" => Duration::minutes(num),
                    "hour" => Duration::hours(num),
                    "day" => Duration::days(num),
                    unit => {
                        return Err(shared::SchedulingError::CondParse(format!(
                            "Unknown interval unit: '{}'",
                            unit
                        ))
                        .into())
                    }
                };
                let period = TimePeriod::Delta(TimeDelta::new(length));
                Ok(cond_task::current_executable(period, 0).into())
            },
        );
        registry.register_pattern(
            Regex::new(r"time of day between (?P<start>\d{1,2}:\d{2}) and (?P<end>\d{1,2}:\d{2})")
                .expect("valid built-in pattern"),
            |kwargs| {
                let period = TimePeriod::time_of_day(
                    Some(kwargs["start"].as_str()),
                    Some(kwargs["end"].as_str()),
                )
                .map_err(|e| shared::SchedulingError::CondParse(e.to_string()))?;
                Ok(cond_task::current_executable(period, 0).into())
            },
        );

        registry
    }

    /// Register a literal syntax.
    pub fn register_literal<F>(&mut self, syntax: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> shared::Result<Condition> + Send + Sync + 'static,
    {
        self.entries
            .push((Syntax::Literal(syntax.into()), Arc::new(factory)));
    }

    /// Register a regex syntax; named capture groups become factory kwargs.
    pub fn register_pattern<F>(&mut self, pattern: Regex, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> shared::Result<Condition> + Send + Sync + 'static,
    {
        self.entries
            .push((Syntax::Pattern(pattern), Arc::new(factory)));
    }

    /// Parse a full condition expression.
    pub fn parse(&self, input: &str) -> shared::Result<Condition> {
        let tokens = tokenize(input);
        if tokens.is_empty() {
            return Err(
                shared::SchedulingError::CondParse("Empty condition string".to_string()).into(),
            );
        }
        let mut stream = TokenStream { tokens, pos: 0 };
        let cond = self.parse_or(&mut stream)?;
        if let Some(trailing) = stream.peek() {
            return Err(shared::SchedulingError::CondParse(format!(
                "Unexpected trailing input in condition '{}': {:?}",
                input, trailing
            ))
            .into());
        }
        Ok(cond)
    }

    fn parse_or(&self, stream: &mut TokenStream) -> shared::Result<Condition> {
        let mut left = self.parse_and(stream)?;
        while stream.peek() == Some(&Token::Or) {
            stream.next();
            let right = self.parse_and(stream)?;
            left = left.or_(right);
        }
        Ok(left)
    }

    fn parse_and(&self, stream: &mut TokenStream) -> shared::Result<Condition> {
        let mut left = self.parse_unary(stream)?;
        while stream.peek() == Some(&Token::And) {
            stream.next();
            let right = self.parse_unary(stream)?;
            left = left.and_(right);
        }
        Ok(left)
    }

    fn parse_unary(&self, stream: &mut TokenStream) -> shared::Result<Condition> {
        match stream.next() {
            Some(Token::Not) => Ok(self.parse_unary(stream)?.not_()),
            Some(Token::Open) => {
                let inner = self.parse_or(stream)?;
                match stream.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(shared::SchedulingError::CondParse(
                        "Unbalanced parenthesis in condition".to_string(),
                    )
                    .into()),
                }
            }
            Some(Token::Atom(text)) => self.parse_atom(&text),
            other => Err(shared::SchedulingError::CondParse(format!(
                "Expected a condition atom, found {:?}",
                other
            ))
            .into()),
        }
    }

    /// Resolve one atom against the registered syntaxes, literals first in
    /// registration order, then patterns (full match required).
    fn parse_atom(&self, text: &str) -> shared::Result<Condition> {
        let empty = HashMap::new();
        for (syntax, factory) in &self.entries {
            match syntax {
                Syntax::Literal(lit) => {
                    if lit == text {
                        return factory(&empty);
                    }
                }
                Syntax::Pattern(pattern) => {
                    if let Some(caps) = pattern.captures(text) {
                        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                        if whole != text {
                            continue;
                        }
                        let mut kwargs = HashMap::new();
                        for name in pattern.capture_names().flatten() {
                            if let Some(m) = caps.name(name) {
                                kwargs.insert(name.to_string(), m.as_str().to_string());
                            }
                        }
                        return factory(&kwargs);
                    }
                }
            }
        }
        Err(shared::SchedulingError::CondParse(format!(
            "Unknown condition syntax: '{}'",
            text
        ))
        .into())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
