//! Operators without data inputs, and the range splitter.

use dagflow_error::Result;

use crate::execution::util::{read_single_scalar, split_bounds};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::plan::kind::RangeParams;
use crate::value::Value;

/// Emits `(i)` for every `i` in a range, restricted to `[start, end)` by
/// position.
#[derive(Debug)]
struct RangeCursor {
    params: RangeParams,
    pos: usize,
    end: usize,
}

impl RangeCursor {
    fn new(params: RangeParams) -> Self {
        RangeCursor {
            params,
            pos: 0,
            end: 0,
        }
    }

    fn reset(&mut self, start: usize, end: usize) {
        self.pos = start;
        self.end = end;
    }

    fn advance(&mut self) -> Result<Option<Value>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let v = self.params.value_at(self.pos)?;
        self.pos += 1;
        Ok(Some(Value::tuple([Value::int64(v)])))
    }
}

#[derive(Debug)]
pub struct PhysicalRangeSource {
    cursor: RangeCursor,
}

impl PhysicalRangeSource {
    pub fn new(params: RangeParams) -> Self {
        PhysicalRangeSource {
            cursor: RangeCursor::new(params),
        }
    }
}

impl Operator for PhysicalRangeSource {
    fn name(&self) -> &'static str {
        "range_source"
    }

    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        let len = self.cursor.params.len();
        self.cursor.reset(0, len);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        self.cursor.advance()
    }

    fn close(&mut self) -> Result<()> {
        self.cursor.reset(0, 0);
        Ok(())
    }
}

/// Emits one slice of a range. The slice index comes from port 0, the slice
/// count from port 1.
#[derive(Debug)]
pub struct PhysicalSplitRange {
    slice: BoxedOperator,
    num_slices: BoxedOperator,
    cursor: RangeCursor,
}

impl PhysicalSplitRange {
    pub fn new(slice: BoxedOperator, num_slices: BoxedOperator, params: RangeParams) -> Self {
        PhysicalSplitRange {
            slice,
            num_slices,
            cursor: RangeCursor::new(params),
        }
    }
}

impl Operator for PhysicalSplitRange {
    fn name(&self) -> &'static str {
        "split_range"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let slice = read_single_scalar(&mut self.slice, ctx)?;
        let num_slices = read_single_scalar(&mut self.num_slices, ctx)?;
        let (start, end) = split_bounds(slice, num_slices, self.cursor.params.len())?;
        self.cursor.reset(start, end);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        self.cursor.advance()
    }

    fn close(&mut self) -> Result<()> {
        self.cursor.reset(0, 0);
        Ok(())
    }
}

/// Emits a single constant tuple per open.
#[derive(Debug)]
pub struct PhysicalConstantTuple {
    value: Value,
    emitted: bool,
}

impl PhysicalConstantTuple {
    pub fn new(value: Value) -> Self {
        PhysicalConstantTuple {
            value,
            emitted: true,
        }
    }
}

impl Operator for PhysicalConstantTuple {
    fn name(&self) -> &'static str {
        "constant_tuple"
    }

    fn open(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        self.emitted = false;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(self.value.clone()))
    }

    fn close(&mut self) -> Result<()> {
        self.emitted = true;
        Ok(())
    }
}

/// Emits one parameter of the execution context.
///
/// Non-tuple parameters are wrapped in a single field tuple.
#[derive(Debug)]
pub struct PhysicalParameterLookup {
    index: usize,
    value: Option<Value>,
}

impl PhysicalParameterLookup {
    pub fn new(index: usize) -> Self {
        PhysicalParameterLookup { index, value: None }
    }
}

impl Operator for PhysicalParameterLookup {
    fn name(&self) -> &'static str {
        "parameter_lookup"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let value = match ctx.parameter(self.index)? {
            v @ Value::Tuple(_) => v.clone(),
            v => Value::tuple([v.clone()]),
        };
        self.value = Some(value);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.value.take())
    }

    fn close(&mut self) -> Result<()> {
        self.value = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};

    #[test]
    fn range_with_step() {
        let ctx = test_context();
        let mut op = PhysicalRangeSource::new(RangeParams { from: 10, to: 0, step: -3 });
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![10, 7, 4, 1], leading_ints(&out));
    }

    #[test]
    fn range_spanning_all_of_i64() {
        let ctx = test_context();
        let mut op = PhysicalRangeSource::new(RangeParams {
            from: i64::MIN,
            to: i64::MAX,
            step: i64::MAX,
        });
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![i64::MIN, -1, i64::MAX - 1], leading_ints(&out));
    }

    #[test]
    fn split_range_slices_are_balanced() {
        let ctx = test_context();
        let params = RangeParams { from: 0, to: 10, step: 1 };
        let mut all = Vec::new();
        let mut sizes = Vec::new();
        for slice in 0..3 {
            let mut op = PhysicalSplitRange::new(
                VecSource::ints([slice]).boxed(),
                VecSource::ints([3]).boxed(),
                params,
            );
            let out = leading_ints(&collect_all(&mut op, &ctx).unwrap());
            sizes.push(out.len());
            all.extend(out);
        }
        assert_eq!((0..10).collect::<Vec<_>>(), all);
        assert_eq!(vec![3, 3, 4], sizes);
    }

    #[test]
    fn constant_once_per_open() {
        let ctx = test_context();
        let mut op = PhysicalConstantTuple::new(Value::tuple([Value::int64(4)]));
        assert_eq!(1, collect_all(&mut op, &ctx).unwrap().len());
        assert_eq!(1, collect_all(&mut op, &ctx).unwrap().len());
    }

    #[test]
    fn parameter_lookup_wraps_scalars() {
        let ctx = test_context().with_worker(1, 4);
        let mut op = PhysicalParameterLookup::new(1);
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![Value::tuple([Value::int64(4)])], out);

        let mut op = PhysicalParameterLookup::new(5);
        op.open(&ctx).unwrap_err();
    }
}
