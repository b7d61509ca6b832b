//! Helpers for tests of operators and plans.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dagflow_error::{DbError, Result};

use crate::config::ExecutionConfig;
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::functions::FunctionRegistry;
use crate::value::Value;

/// Counts calls made to a `VecSource`. Shared with clones of the source.
#[derive(Debug, Default)]
pub struct CallCounts {
    /// Successful opens.
    pub opens: AtomicUsize,
    pub open_attempts: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CallCounts {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Operator yielding a fixed list of values, restarting on every open.
#[derive(Debug, Clone)]
pub struct VecSource {
    values: Vec<Value>,
    pos: usize,
    counts: Arc<CallCounts>,
    /// 1-based open attempt that fails.
    fail_open_at: Option<usize>,
}

impl VecSource {
    pub fn new(values: Vec<Value>) -> Self {
        VecSource {
            values,
            pos: 0,
            counts: Arc::new(CallCounts::default()),
            fail_open_at: None,
        }
    }

    /// Source of single field tuples holding integers.
    pub fn ints(values: impl IntoIterator<Item = i64>) -> Self {
        Self::new(
            values
                .into_iter()
                .map(|v| Value::tuple([Value::int64(v)]))
                .collect(),
        )
    }

    /// Make the given open attempt (starting at 1) fail.
    pub fn failing_open_at(mut self, attempt: usize) -> Self {
        self.fail_open_at = Some(attempt);
        self
    }

    pub fn counts(&self) -> Arc<CallCounts> {
        self.counts.clone()
    }

    pub fn boxed(self) -> BoxedOperator {
        Box::new(self)
    }
}

impl Operator for VecSource {
    fn name(&self) -> &'static str {
        "vec_source"
    }

    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        let attempt = self.counts.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_open_at == Some(attempt) {
            return Err(DbError::resource("Source failed to open").with_field("attempt", attempt));
        }
        self.counts.opens.fetch_add(1, Ordering::SeqCst);
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let out = self.values.get(self.pos).cloned();
        if out.is_some() {
            self.pos += 1;
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        self.counts.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Context with default configuration, call discipline checks enabled.
pub fn test_context() -> ExecutionContext {
    test_context_with_functions(FunctionRegistry::new())
}

pub fn test_context_with_functions(functions: FunctionRegistry) -> ExecutionContext {
    let config = ExecutionConfig {
        num_workers: 2,
        verify_call_discipline: true,
        ..Default::default()
    };
    ExecutionContext::new(config, functions)
}

/// Open an operator, pull everything and close it.
pub fn collect_all(op: &mut dyn Operator, ctx: &ExecutionContext) -> Result<Vec<Value>> {
    op.open(ctx)?;
    let mut out = Vec::new();
    while let Some(v) = op.next()? {
        out.push(v);
    }
    op.close()?;
    Ok(out)
}

/// Integer in the leading field of each tuple.
pub fn leading_ints(values: &[Value]) -> Vec<i64> {
    values
        .iter()
        .map(|v| v.field(0).and_then(|f| f.try_as_i64()))
        .collect::<Result<_>>()
        .unwrap_or_default()
}
