//! Substitution of an integer into a format pattern.
//!
//! `{}` and `{0}` are replaced by the integer. `{{` and `}}` produce literal
//! braces.

use dagflow_error::{DbError, Result};

use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder,
}

fn parse(pattern: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = pattern;
    while !rest.is_empty() {
        let Some(idx) = rest.find(['{', '}']) else {
            pieces.push(Piece::Literal(rest));
            break;
        };
        if idx > 0 {
            pieces.push(Piece::Literal(&rest[..idx]));
        }
        rest = &rest[idx..];

        if let Some(tail) = rest.strip_prefix("{{") {
            pieces.push(Piece::Brace('{'));
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("}}") {
            pieces.push(Piece::Brace('}'));
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("{}") {
            pieces.push(Piece::Placeholder);
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("{0}") {
            pieces.push(Piece::Placeholder);
            rest = tail;
        } else {
            return Err(DbError::plan("Invalid placeholder in pattern")
                .with_field("pattern", pattern)
                .with_field("position", pattern.len() - rest.len()));
        }
    }
    Ok(pieces)
}

/// Check that a pattern only contains supported placeholders.
pub fn check_pattern(pattern: &str) -> Result<()> {
    parse(pattern).map(|_| ())
}

pub fn expand_pattern(pattern: &str, value: i64) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    for piece in parse(pattern)? {
        match piece {
            Piece::Literal(s) => out.push_str(s),
            Piece::Brace(c) => out.push(c),
            Piece::Placeholder => out.push_str(&value.to_string()),
        }
    }
    Ok(out)
}

/// Emits `(expanded)` for every input integer.
///
/// The integer is the input value itself, or the leading field of an input
/// tuple.
#[derive(Debug)]
pub struct PhysicalExpandPattern {
    input: BoxedOperator,
    pattern: String,
}

impl PhysicalExpandPattern {
    pub fn new(input: BoxedOperator, pattern: impl Into<String>) -> Self {
        PhysicalExpandPattern {
            input,
            pattern: pattern.into(),
        }
    }
}

impl Operator for PhysicalExpandPattern {
    fn name(&self) -> &'static str {
        "expand_pattern"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let Some(value) = self.input.next()? else {
            return Ok(None);
        };
        let n = match &value {
            Value::Tuple(_) => value.field(0)?.try_as_i64()?,
            other => other.try_as_i64()?,
        };
        let expanded = expand_pattern(&self.pattern, n)?;
        Ok(Some(Value::tuple([Value::utf8(expanded)])))
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}
