use dagflow_error::Result;

use crate::execution::util::{close_all, concat_fields, open_all};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::Value;

/// Advances every input in lockstep, concatenating their fields.
///
/// Stops as soon as any input is exhausted.
#[derive(Debug)]
pub struct PhysicalZip {
    inputs: Vec<BoxedOperator>,
    exhausted: bool,
}

impl PhysicalZip {
    pub fn new(inputs: Vec<BoxedOperator>) -> Self {
        PhysicalZip {
            inputs,
            exhausted: false,
        }
    }
}

impl Operator for PhysicalZip {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        open_all(&mut self.inputs, ctx)?;
        self.exhausted = false;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.inputs.len());
        for input in &mut self.inputs {
            match input.next()? {
                Some(v) => values.push(v),
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
        Ok(Some(concat_fields(values)))
    }

    fn close(&mut self) -> Result<()> {
        close_all(&mut self.inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{VecSource, collect_all, test_context};

    #[test]
    fn stops_at_shortest() {
        let ctx = test_context();
        let short = VecSource::ints([1, 2]);
        let long = VecSource::ints([10, 20, 30]);
        let mut zip = PhysicalZip::new(vec![long.boxed(), short.boxed()]);

        let out = collect_all(&mut zip, &ctx).unwrap();
        assert_eq!(
            vec![
                Value::tuple([Value::int64(10), Value::int64(1)]),
                Value::tuple([Value::int64(20), Value::int64(2)]),
            ],
            out
        );
    }
}
