use dagflow_error::{DbError, Result};

use crate::execution::util::{RestartableInput, concat_fields};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::Value;

/// Cross product of two inputs.
///
/// The right input (port 1) is the outer loop. The left input (port 0) is
/// replayed by closing and reopening it every time the right input advances.
/// Output tuples hold the left fields followed by the right fields.
#[derive(Debug)]
pub struct PhysicalCartesian {
    left: RestartableInput,
    right: BoxedOperator,
    ctx: Option<ExecutionContext>,
    outer: Option<Value>,
    /// Whether the current pass over the left input produced anything.
    produced_in_pass: bool,
    done: bool,
}

impl PhysicalCartesian {
    pub fn new(left: BoxedOperator, right: BoxedOperator) -> Self {
        PhysicalCartesian {
            left: RestartableInput::new(left),
            right,
            ctx: None,
            outer: None,
            produced_in_pass: false,
            done: false,
        }
    }
}

impl Operator for PhysicalCartesian {
    fn name(&self) -> &'static str {
        "cartesian"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.left.open(ctx)?;
        if let Err(e) = self.right.open(ctx) {
            if let Err(close_err) = self.left.close() {
                tracing::warn!(%close_err, "failed to close input after failed open");
            }
            return Err(e);
        }
        self.ctx = Some(ctx.clone());
        self.outer = None;
        self.produced_in_pass = false;
        self.done = false;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| DbError::protocol("Cartesian pulled before open"))?;
        let (left, right) = (&mut self.left, &mut self.right);

        while !self.done {
            if self.outer.is_none() {
                match right.next()? {
                    Some(v) => self.outer = Some(v),
                    None => {
                        self.done = true;
                        break;
                    }
                }
            }
            let Some(outer) = &self.outer else {
                break;
            };

            match left.next()? {
                Some(inner) => {
                    self.produced_in_pass = true;
                    return Ok(Some(concat_fields([inner, outer.clone()])));
                }
                None => {
                    if !self.produced_in_pass {
                        // Empty left input, nothing to pair with.
                        self.done = true;
                        break;
                    }
                    left.restart(ctx)?;
                    self.outer = None;
                    self.produced_in_pass = false;
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.ctx = None;
        self.outer = None;
        let left_result = self.left.close();
        self.right.close()?;
        left_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{VecSource, collect_all, test_context};

    fn pair(l: i64, r: &str) -> Value {
        Value::tuple([Value::int64(l), Value::utf8(r)])
    }

    fn strs(vals: &[&str]) -> VecSource {
        VecSource::new(vals.iter().map(|s| Value::tuple([Value::utf8(*s)])).collect())
    }

    #[test]
    fn right_is_outer_loop() {
        let ctx = test_context();
        let left = VecSource::ints([1, 2]);
        let left_counts = left.counts();
        let mut op = PhysicalCartesian::new(left.boxed(), strs(&["x", "y", "z"]).boxed());

        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(
            vec![
                pair(1, "x"),
                pair(2, "x"),
                pair(1, "y"),
                pair(2, "y"),
                pair(1, "z"),
                pair(2, "z"),
            ],
            out
        );
        // Initial open plus one replay per right value.
        assert_eq!(4, left_counts.opens());
        assert_eq!(left_counts.opens(), left_counts.closes());
    }

    #[test]
    fn empty_side_yields_nothing() {
        let ctx = test_context();
        let mut op = PhysicalCartesian::new(VecSource::new(Vec::new()).boxed(), strs(&["x"]).boxed());
        assert!(collect_all(&mut op, &ctx).unwrap().is_empty());

        let mut op = PhysicalCartesian::new(VecSource::ints([1]).boxed(), strs(&[]).boxed());
        assert!(collect_all(&mut op, &ctx).unwrap().is_empty());
    }

    #[test]
    fn failed_replay_closes_left_once() {
        let ctx = test_context();
        let left = VecSource::ints([1]).failing_open_at(2);
        let left_counts = left.counts();
        let right = VecSource::ints([10, 20]);
        let right_counts = right.counts();
        let mut op = PhysicalCartesian::new(left.boxed(), right.boxed());

        op.open(&ctx).unwrap();
        assert_eq!(
            Some(Value::tuple([Value::int64(1), Value::int64(10)])),
            op.next().unwrap()
        );
        op.next().unwrap_err();
        op.close().unwrap();

        assert_eq!(1, left_counts.opens());
        assert_eq!(1, left_counts.closes());
        assert_eq!(1, right_counts.closes());
    }
}
