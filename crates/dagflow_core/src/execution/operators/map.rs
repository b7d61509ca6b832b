use dagflow_error::Result;

use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::functions::{MapFn, PredicateFn};
use crate::value::Value;

/// Applies a function to every tuple.
pub struct PhysicalMap {
    input: BoxedOperator,
    func: MapFn,
}

impl std::fmt::Debug for PhysicalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMap")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl PhysicalMap {
    pub fn new(input: BoxedOperator, func: MapFn) -> Self {
        PhysicalMap { input, func }
    }
}

impl Operator for PhysicalMap {
    fn name(&self) -> &'static str {
        "map"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self) -> Result<Option<Value>> {
        match self.input.next()? {
            Some(v) => Ok(Some((self.func)(&v)?)),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

/// Passes through tuples for which the predicate holds.
pub struct PhysicalFilter {
    input: BoxedOperator,
    predicate: PredicateFn,
}

impl std::fmt::Debug for PhysicalFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalFilter")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl PhysicalFilter {
    pub fn new(input: BoxedOperator, predicate: PredicateFn) -> Self {
        PhysicalFilter { input, predicate }
    }
}

impl Operator for PhysicalFilter {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self) -> Result<Option<Value>> {
        while let Some(v) = self.input.next()? {
            if (self.predicate)(&v)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};

    fn times_ten(v: &Value) -> Result<Value> {
        Ok(Value::tuple([Value::int64(v.field(0)?.try_as_i64()? * 10)]))
    }

    fn above_fifteen(v: &Value) -> Result<bool> {
        Ok(v.field(0)?.try_as_i64()? > 15)
    }

    fn first_field(v: &Value) -> Result<Value> {
        v.field(0).cloned()
    }

    #[test]
    fn map_then_filter() {
        let ctx = test_context();
        let map = PhysicalMap::new(VecSource::ints([1, 2, 3, 4]).boxed(), Arc::new(times_ten));
        let mut filter = PhysicalFilter::new(Box::new(map), Arc::new(above_fifteen));

        let out = collect_all(&mut filter, &ctx).unwrap();
        assert_eq!(vec![20, 30, 40], leading_ints(&out));
    }

    #[test]
    fn function_error_propagates() {
        let ctx = test_context();
        let mut map = PhysicalMap::new(
            VecSource::new(vec![Value::utf8("not a tuple")]).boxed(),
            Arc::new(first_field),
        );
        map.open(&ctx).unwrap();
        map.next().unwrap_err();
        map.close().unwrap();
    }
}
