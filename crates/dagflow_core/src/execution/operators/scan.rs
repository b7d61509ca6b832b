//! Scans over materialized row vectors and column chunks, optionally
//! restricted to one slice of each chunk.

use dagflow_error::{DbError, Result};

use crate::execution::util::{read_single_scalar, split_bounds};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::value::{ArrayValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanLayout {
    /// Each input value is an array of row tuples.
    Rows,
    /// Each input value is a tuple of equally long column arrays.
    Columns,
}

#[derive(Debug)]
enum Chunk {
    Rows(ArrayValue),
    Columns(Vec<ArrayValue>),
}

impl Chunk {
    fn from_value(layout: ScanLayout, value: Value) -> Result<Self> {
        match (layout, value) {
            (ScanLayout::Rows, Value::Array(rows)) => Ok(Chunk::Rows(rows)),
            (ScanLayout::Rows, Value::Tuple(mut fields)) if fields.len() == 1 => {
                match fields.pop() {
                    Some(Value::Array(rows)) => Ok(Chunk::Rows(rows)),
                    _ => Err(DbError::protocol("Row scan input must hold an array")),
                }
            }
            (ScanLayout::Columns, Value::Tuple(fields)) => {
                let columns = fields
                    .into_iter()
                    .map(|f| match f {
                        Value::Array(col) => Ok(col),
                        other => Err(DbError::protocol("Column chunk field is not an array")
                            .with_field("tag", other.tag())),
                    })
                    .collect::<Result<Vec<_>>>()?;
                if let Some(first) = columns.first() {
                    if columns.iter().any(|c| c.len() != first.len()) {
                        return Err(DbError::protocol("Column chunk columns differ in length"));
                    }
                }
                Ok(Chunk::Columns(columns))
            }
            (layout, other) => Err(DbError::protocol("Unexpected scan input")
                .with_field("layout", format!("{layout:?}"))
                .with_field("tag", other.tag())),
        }
    }

    fn len(&self) -> usize {
        match self {
            Chunk::Rows(rows) => rows.len(),
            Chunk::Columns(cols) => cols.first().map(|c| c.len()).unwrap_or(0),
        }
    }

    /// Zero copy view over part of the chunk.
    fn slice(&self, start: usize, len: usize) -> Result<Self> {
        match self {
            Chunk::Rows(rows) => Ok(Chunk::Rows(rows.slice(start, len)?)),
            Chunk::Columns(cols) => Ok(Chunk::Columns(
                cols.iter()
                    .map(|c| c.slice(start, len))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    fn row(&self, idx: usize) -> Result<Value> {
        let missing = || DbError::protocol("Scan position outside of chunk").with_field("idx", idx);
        match self {
            Chunk::Rows(rows) => rows.get(idx).cloned().ok_or_else(missing),
            Chunk::Columns(cols) => cols
                .iter()
                .map(|c| c.get(idx).cloned().ok_or_else(missing))
                .collect::<Result<Vec<_>>>()
                .map(Value::Tuple),
        }
    }
}

/// Slice of every chunk this scan emits.
#[derive(Debug)]
struct SliceInputs {
    slice: BoxedOperator,
    num_slices: BoxedOperator,
}

/// Emits the rows of every chunk its data input produces.
///
/// A split scan reads a slice index and slice count at open, and only emits
/// that slice of each chunk.
#[derive(Debug)]
pub struct PhysicalScan {
    layout: ScanLayout,
    data: BoxedOperator,
    split: Option<SliceInputs>,
    /// Slice index and count, set when opened as a split scan.
    bounds: Option<(usize, usize)>,
    current: Option<Chunk>,
    pos: usize,
}

impl PhysicalScan {
    pub fn new(layout: ScanLayout, data: BoxedOperator) -> Self {
        PhysicalScan {
            layout,
            data,
            split: None,
            bounds: None,
            current: None,
            pos: 0,
        }
    }

    /// Scan reading only one slice of each chunk.
    pub fn new_split(
        layout: ScanLayout,
        data: BoxedOperator,
        slice: BoxedOperator,
        num_slices: BoxedOperator,
    ) -> Self {
        PhysicalScan {
            split: Some(SliceInputs { slice, num_slices }),
            ..Self::new(layout, data)
        }
    }
}

impl Operator for PhysicalScan {
    fn name(&self) -> &'static str {
        match (self.layout, self.split.is_some()) {
            (ScanLayout::Rows, false) => "row_scan",
            (ScanLayout::Columns, false) => "column_scan",
            (ScanLayout::Rows, true) => "split_row_data",
            (ScanLayout::Columns, true) => "split_column_data",
        }
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.bounds = match self.split.as_mut() {
            Some(split) => {
                let slice = read_single_scalar(&mut split.slice, ctx)?;
                let num_slices = read_single_scalar(&mut split.num_slices, ctx)?;
                // Validate early.
                split_bounds(slice, num_slices, 0)?;
                Some((slice, num_slices))
            }
            None => None,
        };
        self.data.open(ctx)?;
        self.current = None;
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(chunk) = &self.current {
                if self.pos < chunk.len() {
                    let row = chunk.row(self.pos)?;
                    self.pos += 1;
                    return Ok(Some(row));
                }
                self.current = None;
            }

            let Some(value) = self.data.next()? else {
                return Ok(None);
            };
            let chunk = Chunk::from_value(self.layout, value)?;
            let chunk = match self.bounds {
                Some((slice, num_slices)) => {
                    let (start, end) = split_bounds(slice, num_slices, chunk.len())?;
                    chunk.slice(start, end - start)?
                }
                None => chunk,
            };
            self.current = Some(chunk);
            self.pos = 0;
        }
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        self.data.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};

    fn row_chunk(vals: impl IntoIterator<Item = i64>) -> Value {
        Value::array(vals.into_iter().map(|v| Value::tuple([Value::int64(v)])))
    }

    #[test]
    fn row_scan_flattens_chunks() {
        let ctx = test_context();
        let data = VecSource::new(vec![row_chunk([1, 2]), Value::tuple([row_chunk([3])])]);
        let mut op = PhysicalScan::new(ScanLayout::Rows, data.boxed());
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(vec![1, 2, 3], leading_ints(&out));
    }

    #[test]
    fn column_scan_transposes() {
        let ctx = test_context();
        let chunk = Value::tuple([
            Value::array([Value::int64(1), Value::int64(2)]),
            Value::array([Value::utf8("a"), Value::utf8("b")]),
        ]);
        let mut op = PhysicalScan::new(ScanLayout::Columns, VecSource::new(vec![chunk]).boxed());
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(
            vec![
                Value::tuple([Value::int64(1), Value::utf8("a")]),
                Value::tuple([Value::int64(2), Value::utf8("b")]),
            ],
            out
        );
    }

    #[test]
    fn split_scans_partition_each_chunk() {
        let ctx = test_context();
        let mut all = Vec::new();
        let mut sizes = Vec::new();
        for slice in 0..4 {
            let data = VecSource::new(vec![row_chunk(0..10)]);
            let mut op = PhysicalScan::new_split(
                ScanLayout::Rows,
                data.boxed(),
                VecSource::ints([slice]).boxed(),
                VecSource::ints([4]).boxed(),
            );
            let out = leading_ints(&collect_all(&mut op, &ctx).unwrap());
            sizes.push(out.len());
            all.extend(out);
        }
        assert_eq!((0..10).collect::<Vec<_>>(), all);
        assert_eq!(vec![2, 3, 2, 3], sizes);
    }

    #[test]
    fn split_columns_share_buffers() {
        let col = ArrayValue::from_values((0..6).map(Value::int64).collect());
        let chunk = Chunk::Columns(vec![col.clone()]);
        let sliced = chunk.slice(2, 3).unwrap();
        match &sliced {
            Chunk::Columns(cols) => {
                assert!(cols[0].shares_buffer(&col));
                assert_eq!(Value::int64(2), cols[0].get(0).cloned().unwrap());
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert_eq!(3, sliced.len());
    }

    #[test]
    fn bad_slice_index() {
        let ctx = test_context();
        let mut op = PhysicalScan::new_split(
            ScanLayout::Columns,
            VecSource::new(Vec::new()).boxed(),
            VecSource::ints([4]).boxed(),
            VecSource::ints([4]).boxed(),
        );
        op.open(&ctx).unwrap_err();
    }
}
