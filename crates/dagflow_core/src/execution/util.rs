use dagflow_error::{DbError, Result};

use super::{BoxedOperator, ExecutionContext};
use crate::value::Value;

/// Open every input, closing the ones already opened if one fails.
pub fn open_all(inputs: &mut [BoxedOperator], ctx: &ExecutionContext) -> Result<()> {
    for idx in 0..inputs.len() {
        if let Err(e) = inputs[idx].open(ctx) {
            for opened in &mut inputs[..idx] {
                if let Err(close_err) = opened.close() {
                    tracing::warn!(%close_err, "failed to close input after failed open");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Close every input, returning the first error.
pub fn close_all(inputs: &mut [BoxedOperator]) -> Result<()> {
    let mut first = None;
    for input in inputs {
        if let Err(e) = input.close() {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Pull every remaining value from an open operator.
pub fn pull_all(input: &mut BoxedOperator) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    while let Some(v) = input.next()? {
        out.push(v);
    }
    Ok(out)
}

/// Open, drain and close an operator.
///
/// The operator is closed even when pulling fails.
pub fn drain(input: &mut BoxedOperator, ctx: &ExecutionContext) -> Result<Vec<Value>> {
    input.open(ctx)?;
    match pull_all(input) {
        Ok(values) => {
            input.close()?;
            Ok(values)
        }
        Err(e) => {
            if let Err(close_err) = input.close() {
                tracing::warn!(%close_err, "failed to close input after error");
            }
            Err(e)
        }
    }
}

/// Run `f` over values pulled from an opened operator, closing it afterwards
/// regardless of the outcome.
pub fn drain_with<F>(input: &mut BoxedOperator, ctx: &ExecutionContext, mut f: F) -> Result<()>
where
    F: FnMut(Value) -> Result<()>,
{
    input.open(ctx)?;
    let result = (|| -> Result<()> {
        while let Some(v) = input.next()? {
            f(v)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => input.close(),
        Err(e) => {
            if let Err(close_err) = input.close() {
                tracing::warn!(%close_err, "failed to close input after error");
            }
            Err(e)
        }
    }
}

/// An input that gets closed and reopened while its consumer stays open.
///
/// Tracks whether the wrapped operator is currently open. A failed reopen
/// leaves it closed, and `close` on a closed input does nothing.
#[derive(Debug)]
pub struct RestartableInput {
    op: BoxedOperator,
    is_open: bool,
}

impl RestartableInput {
    pub fn new(op: BoxedOperator) -> Self {
        RestartableInput { op, is_open: false }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.op.open(ctx)?;
        self.is_open = true;
        Ok(())
    }

    pub fn restart(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.close()?;
        self.open(ctx)
    }

    pub fn next(&mut self) -> Result<Option<Value>> {
        if !self.is_open {
            return Err(DbError::protocol("Input pulled while closed"));
        }
        self.op.next()
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        self.op.close()
    }
}

/// Read the single scalar an arity input produces before it's exhausted.
///
/// Accepts either an atomic value or a one field tuple.
pub fn read_single_scalar(input: &mut BoxedOperator, ctx: &ExecutionContext) -> Result<usize> {
    let values = drain(input, ctx)?;
    let value = match values.as_slice() {
        [v] => v,
        other => {
            return Err(DbError::protocol("Expected exactly one value from arity input")
                .with_field("num_values", other.len()));
        }
    };
    match value {
        Value::Tuple(fields) if fields.len() == 1 => fields[0].try_as_usize(),
        Value::Tuple(fields) => Err(DbError::protocol("Expected a single field tuple")
            .with_field("num_fields", fields.len())),
        other => other.try_as_usize(),
    }
}

/// Fields of a tuple, or the value itself as a single field.
pub fn into_fields(value: Value) -> Vec<Value> {
    match value {
        Value::Tuple(fields) => fields,
        other => vec![other],
    }
}

/// Concatenate the fields of several values into one tuple.
pub fn concat_fields(values: impl IntoIterator<Item = Value>) -> Value {
    Value::Tuple(values.into_iter().flat_map(into_fields).collect())
}

/// Bounds `[start, end)` of slice `slice` when splitting `size` elements into
/// `num_slices` contiguous parts.
///
/// Boundaries use floor division, so part sizes differ by at most one.
pub fn split_bounds(slice: usize, num_slices: usize, size: usize) -> Result<(usize, usize)> {
    if num_slices == 0 {
        return Err(DbError::protocol("Number of slices must be greater than zero"));
    }
    if slice >= num_slices {
        return Err(DbError::protocol("Slice index out of range")
            .with_field("slice", slice)
            .with_field("num_slices", num_slices));
    }
    let bound = |s: usize| ((s as u128 * size as u128) / num_slices as u128) as usize;
    Ok((bound(slice), bound(slice + 1)))
}
