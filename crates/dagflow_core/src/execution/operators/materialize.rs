//! Operators that fully consume their input into a single result, and the
//! columnar store scan.

use std::collections::VecDeque;

use dagflow_error::{DbError, Result, ResultExt};

use crate::execution::util::{drain, into_fields};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::plan::kind::ParquetScanParams;
use crate::value::{ArrayValue, Value};

/// Emits the single tuple its input produces. Zero or several tuples is a
/// protocol violation.
#[derive(Debug)]
pub struct PhysicalEnsureSingleTuple {
    input: BoxedOperator,
    value: Option<Value>,
}

impl PhysicalEnsureSingleTuple {
    pub fn new(input: BoxedOperator) -> Self {
        PhysicalEnsureSingleTuple { input, value: None }
    }
}

impl Operator for PhysicalEnsureSingleTuple {
    fn name(&self) -> &'static str {
        "ensure_single_tuple"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let mut values = drain(&mut self.input, ctx)?;
        if values.len() != 1 {
            return Err(DbError::protocol("Expected exactly one tuple")
                .with_field("num_tuples", values.len()));
        }
        self.value = values.pop();
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeLayout {
    /// One tuple holding an array of all rows.
    RowVector,
    /// One tuple holding an array per column.
    ColumnChunks,
}

/// Turn rows into one array per column.
pub fn rows_to_columns(rows: Vec<Value>) -> Result<Vec<ArrayValue>> {
    let mut columns: Vec<Vec<Value>> = Vec::new();
    for (idx, row) in rows.into_iter().enumerate() {
        let fields = into_fields(row);
        if idx == 0 {
            columns = fields.iter().map(|_| Vec::new()).collect();
        } else if fields.len() != columns.len() {
            return Err(DbError::protocol("Rows differ in number of fields")
                .with_field("row", idx)
                .with_field("expected", columns.len())
                .with_field("got", fields.len()));
        }
        for (col, v) in columns.iter_mut().zip(fields) {
            col.push(v);
        }
    }
    Ok(columns.into_iter().map(ArrayValue::from_values).collect())
}

/// Materializes the whole input into a single tuple.
#[derive(Debug)]
pub struct PhysicalMaterialize {
    input: BoxedOperator,
    layout: MaterializeLayout,
    value: Option<Value>,
}

impl PhysicalMaterialize {
    pub fn new(input: BoxedOperator, layout: MaterializeLayout) -> Self {
        PhysicalMaterialize {
            input,
            layout,
            value: None,
        }
    }
}

impl Operator for PhysicalMaterialize {
    fn name(&self) -> &'static str {
        match self.layout {
            MaterializeLayout::RowVector => "materialize_row_vector",
            MaterializeLayout::ColumnChunks => "materialize_column_chunks",
        }
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let rows = drain(&mut self.input, ctx)?;
        let num_rows = rows.len();
        let value = match self.layout {
            MaterializeLayout::RowVector => {
                Value::tuple([Value::Array(ArrayValue::from_values(rows))])
            }
            MaterializeLayout::ColumnChunks => {
                Value::Tuple(rows_to_columns(rows)?.into_iter().map(Value::Array).collect())
            }
        };
        tracing::debug!(operator = self.name(), num_rows, "materialized input");
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

/// Writes the whole input to the columnar store and emits `(num_rows)`.
///
/// Rows cross into the store in serialized form.
#[derive(Debug)]
pub struct PhysicalMaterializeParquet {
    input: BoxedOperator,
    path: String,
    value: Option<Value>,
}

impl PhysicalMaterializeParquet {
    pub fn new(input: BoxedOperator, path: impl Into<String>) -> Self {
        PhysicalMaterializeParquet {
            input,
            path: path.into(),
            value: None,
        }
    }
}

impl Operator for PhysicalMaterializeParquet {
    fn name(&self) -> &'static str {
        "materialize_parquet"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let store = ctx.store()?.clone();
        let rows = drain(&mut self.input, ctx)?;
        let payload = store.codec().encode_values(&rows)?;
        let written = store
            .write(&self.path, payload)
            .context_fn(|| format!("Failed to write '{}'", self.path))?;
        tracing::debug!(path = %self.path, written, "wrote rows to store");
        self.value = Some(Value::tuple([Value::int64(written as i64)]));
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

/// Reads rows from the columnar store, skipping row groups whose statistics
/// rule out every predicate.
#[derive(Debug)]
pub struct PhysicalParquetScan {
    params: ParquetScanParams,
    rows: VecDeque<Value>,
}

impl PhysicalParquetScan {
    pub fn new(params: ParquetScanParams) -> Self {
        PhysicalParquetScan {
            params,
            rows: VecDeque::new(),
        }
    }
}

impl Operator for PhysicalParquetScan {
    fn name(&self) -> &'static str {
        "parquet_scan"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let store = ctx.store()?;
        let result = store
            .scan(&self.params.path, &self.params.predicates, &self.params.columns)
            .context_fn(|| format!("Failed to scan '{}'", self.params.path))?;
        tracing::debug!(
            path = %self.params.path,
            scanned = result.row_groups_scanned,
            pruned = result.row_groups_pruned,
            "scanned store"
        );
        self.rows = result.batches.into_iter().flatten().collect();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dagflow_error::ErrorKind;

    use super::*;
    use crate::runtime::store::{CompareOp, MemoryColumnarStore, ScanPredicate};
    use crate::testutil::{VecSource, collect_all, leading_ints, test_context};
    use crate::value::ScalarValue;
    use crate::value::wire::JsonWireCodec;

    #[test]
    fn ensure_single() {
        let ctx = test_context();
        let mut op = PhysicalEnsureSingleTuple::new(VecSource::ints([5]).boxed());
        assert_eq!(vec![5], leading_ints(&collect_all(&mut op, &ctx).unwrap()));

        let mut op = PhysicalEnsureSingleTuple::new(VecSource::ints([5, 6]).boxed());
        let err = op.open(&ctx).unwrap_err();
        assert_eq!(ErrorKind::ProtocolViolation, err.kind());

        let mut op = PhysicalEnsureSingleTuple::new(VecSource::ints([]).boxed());
        op.open(&ctx).unwrap_err();
    }

    #[test]
    fn column_chunks() {
        let ctx = test_context();
        let rows = vec![
            Value::tuple([Value::int64(1), Value::utf8("a")]),
            Value::tuple([Value::int64(2), Value::utf8("b")]),
        ];
        let mut op =
            PhysicalMaterialize::new(VecSource::new(rows).boxed(), MaterializeLayout::ColumnChunks);
        let out = collect_all(&mut op, &ctx).unwrap();
        assert_eq!(
            vec![Value::tuple([
                Value::array([Value::int64(1), Value::int64(2)]),
                Value::array([Value::utf8("a"), Value::utf8("b")]),
            ])],
            out
        );
    }

    #[test]
    fn ragged_rows_rejected() {
        let rows = vec![
            Value::tuple([Value::int64(1), Value::utf8("a")]),
            Value::tuple([Value::int64(2)]),
        ];
        rows_to_columns(rows).unwrap_err();
    }

    #[test]
    fn store_round_trip_with_pruning() {
        let store = Arc::new(MemoryColumnarStore::new(Arc::new(JsonWireCodec), 4));
        let ctx = test_context().with_store(store.clone());

        let mut write = PhysicalMaterializeParquet::new(
            VecSource::ints(0..12).boxed(),
            "/tmp/ints.parquet",
        );
        let out = collect_all(&mut write, &ctx).unwrap();
        assert_eq!(vec![12], leading_ints(&out));

        let mut scan = PhysicalParquetScan::new(ParquetScanParams {
            path: "/tmp/ints.parquet".to_string(),
            columns: Vec::new(),
            predicates: vec![ScanPredicate {
                column: 0,
                op: CompareOp::GtEq,
                value: ScalarValue::Int64(9),
            }],
        });
        let out = collect_all(&mut scan, &ctx).unwrap();
        assert_eq!(vec![9, 10, 11], leading_ints(&out));
    }

    #[test]
    fn missing_store_is_resource_error() {
        let ctx = test_context();
        let mut write = PhysicalMaterializeParquet::new(VecSource::ints([1]).boxed(), "x");
        let err = write.open(&ctx).unwrap_err();
        assert_eq!(ErrorKind::Resource, err.kind());
    }
}
