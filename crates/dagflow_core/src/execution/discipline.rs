use dagflow_error::{DbError, Result};

use super::{BoxedOperator, ExecutionContext, Operator};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Closed,
    Open,
    Exhausted,
}

/// Wraps an operator and checks the open/next/close call order.
///
/// Only operators that cache build state may be opened again before being
/// closed. Each such open needs its own close.
#[derive(Debug)]
pub struct CallDiscipline {
    inner: BoxedOperator,
    allow_reopen: bool,
    state: CallState,
    depth: usize,
}

impl CallDiscipline {
    pub fn new(inner: BoxedOperator, allow_reopen: bool) -> Self {
        CallDiscipline {
            inner,
            allow_reopen,
            state: CallState::Closed,
            depth: 0,
        }
    }

    fn violation(&self, msg: &'static str) -> DbError {
        DbError::protocol(msg)
            .with_field("operator", self.inner.name())
            .with_field("depth", self.depth)
    }
}

impl Operator for CallDiscipline {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.state != CallState::Closed && !self.allow_reopen {
            return Err(self.violation("Operator opened twice without close"));
        }
        self.inner.open(ctx)?;
        self.depth += 1;
        self.state = CallState::Open;
        tracing::trace!(operator = self.inner.name(), depth = self.depth, "opened");
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        match self.state {
            CallState::Closed => Err(self.violation("Next called on closed operator")),
            CallState::Exhausted => Err(self.violation("Next called after exhaustion")),
            CallState::Open => {
                let out = self.inner.next()?;
                if out.is_none() {
                    tracing::trace!(operator = self.inner.name(), "exhausted");
                    self.state = CallState::Exhausted;
                }
                Ok(out)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.state == CallState::Closed {
            return Err(self.violation("Close called on closed operator"));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.state = CallState::Closed;
        }
        tracing::trace!(operator = self.inner.name(), depth = self.depth, "closed");
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use dagflow_error::ErrorKind;

    use super::*;
    use crate::testutil::{VecSource, test_context};

    fn wrapped(allow_reopen: bool) -> CallDiscipline {
        let source = VecSource::new(vec![Value::int64(1)]);
        CallDiscipline::new(Box::new(source), allow_reopen)
    }

    #[test]
    fn next_before_open() {
        let mut op = wrapped(false);
        let err = op.next().unwrap_err();
        assert_eq!(ErrorKind::ProtocolViolation, err.kind());
    }

    #[test]
    fn next_after_exhaustion() {
        let ctx = test_context();
        let mut op = wrapped(false);
        op.open(&ctx).unwrap();
        assert!(op.next().unwrap().is_some());
        assert!(op.next().unwrap().is_none());
        op.next().unwrap_err();
        op.close().unwrap();
    }

    #[test]
    fn double_open_depends_on_caching() {
        let ctx = test_context();
        let mut op = wrapped(false);
        op.open(&ctx).unwrap();
        op.open(&ctx).unwrap_err();
        op.close().unwrap();
        op.close().unwrap_err();

        let mut op = wrapped(true);
        op.open(&ctx).unwrap();
        op.open(&ctx).unwrap();
        op.close().unwrap();
        op.close().unwrap();
        op.close().unwrap_err();
    }
}
