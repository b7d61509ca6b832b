use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use dagflow_error::{DbError, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::value::wire::WireCodec;
use crate::value::{ScalarValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn matches(&self, lhs: &ScalarValue, rhs: &ScalarValue) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Lt => lhs < rhs,
            Self::LtEq => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::GtEq => lhs >= rhs,
        }
    }

    /// If any value within `[min, max]` could match.
    pub fn may_match_range(&self, min: &ScalarValue, max: &ScalarValue, rhs: &ScalarValue) -> bool {
        match self {
            Self::Eq => min <= rhs && rhs <= max,
            Self::Lt => min < rhs,
            Self::LtEq => min <= rhs,
            Self::Gt => max > rhs,
            Self::GtEq => max >= rhs,
        }
    }
}

/// `column <op> value`, evaluated against the columns of a stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPredicate {
    pub column: usize,
    pub op: CompareOp,
    pub value: ScalarValue,
}

impl ScanPredicate {
    fn matches(&self, row: &[Value]) -> bool {
        match row.get(self.column) {
            Some(Value::Atomic(v)) => self.op.matches(v, &self.value),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// One batch of row tuples per row group that survived pruning.
    pub batches: Vec<Vec<Value>>,
    pub row_groups_scanned: usize,
    pub row_groups_pruned: usize,
}

/// Columnar file store.
pub trait ColumnarStore: Debug + Sync + Send {
    /// Write rows to `path`, replacing anything already there.
    ///
    /// `payload` holds row tuples encoded with the store's codec. Returns the
    /// number of rows written.
    fn write(&self, path: &str, payload: Bytes) -> Result<usize>;

    /// Read rows matching every predicate, projected to `projection` (all
    /// columns if empty).
    fn scan(
        &self,
        path: &str,
        predicates: &[ScanPredicate],
        projection: &[usize],
    ) -> Result<ScanResult>;

    fn codec(&self) -> &dyn WireCodec;
}

#[derive(Debug, Clone)]
struct ColumnStats {
    min: ScalarValue,
    max: ScalarValue,
}

#[derive(Debug)]
struct RowGroup {
    num_rows: usize,
    columns: Vec<Vec<Value>>,
    /// Stats per column, None if the column has non-atomic values.
    stats: Vec<Option<ColumnStats>>,
}

impl RowGroup {
    fn from_rows(rows: &[Vec<Value>], num_columns: usize) -> Self {
        let mut columns = vec![Vec::with_capacity(rows.len()); num_columns];
        for row in rows {
            for (col, v) in row.iter().enumerate() {
                columns[col].push(v.clone());
            }
        }

        let stats = columns
            .iter()
            .map(|col| {
                let mut stats: Option<ColumnStats> = None;
                for v in col {
                    let Value::Atomic(s) = v else {
                        return None;
                    };
                    stats = Some(match stats {
                        None => ColumnStats {
                            min: s.clone(),
                            max: s.clone(),
                        },
                        Some(st) => ColumnStats {
                            min: if s < &st.min { s.clone() } else { st.min },
                            max: if s > &st.max { s.clone() } else { st.max },
                        },
                    });
                }
                stats
            })
            .collect();

        RowGroup {
            num_rows: rows.len(),
            columns,
            stats,
        }
    }

    fn can_prune(&self, predicates: &[ScanPredicate]) -> bool {
        predicates.iter().any(|p| match self.stats.get(p.column) {
            Some(Some(st)) => !p.op.may_match_range(&st.min, &st.max, &p.value),
            _ => false,
        })
    }

    fn row(&self, idx: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[idx].clone()).collect()
    }
}

/// In-memory columnar store splitting written rows into fixed size row
/// groups with min/max statistics.
#[derive(Debug)]
pub struct MemoryColumnarStore {
    codec: Arc<dyn WireCodec>,
    row_group_size: usize,
    tables: Mutex<HashMap<String, Arc<Vec<RowGroup>>>>,
}

impl MemoryColumnarStore {
    pub fn new(codec: Arc<dyn WireCodec>, row_group_size: usize) -> Self {
        MemoryColumnarStore {
            codec,
            row_group_size: row_group_size.max(1),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn num_row_groups(&self, path: &str) -> Option<usize> {
        self.tables.lock().get(path).map(|t| t.len())
    }
}

impl ColumnarStore for MemoryColumnarStore {
    fn write(&self, path: &str, payload: Bytes) -> Result<usize> {
        let rows = self
            .codec
            .decode_values(&payload)?
            .into_iter()
            .map(Value::try_into_tuple)
            .collect::<Result<Vec<_>>>()?;

        let num_columns = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != num_columns) {
            return Err(DbError::protocol("Rows written to a store must have the same width")
                .with_field("expected", num_columns)
                .with_field("got", bad.len()));
        }

        let groups: Vec<_> = rows
            .chunks(self.row_group_size)
            .map(|chunk| RowGroup::from_rows(chunk, num_columns))
            .collect();

        tracing::debug!(%path, rows = rows.len(), row_groups = groups.len(), "wrote table");
        self.tables.lock().insert(path.to_string(), Arc::new(groups));

        Ok(rows.len())
    }

    fn scan(
        &self,
        path: &str,
        predicates: &[ScanPredicate],
        projection: &[usize],
    ) -> Result<ScanResult> {
        let groups = self
            .tables
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| DbError::resource(format!("Cannot find table '{path}'")))?;

        let mut result = ScanResult::default();
        for group in groups.iter() {
            if group.can_prune(predicates) {
                result.row_groups_pruned += 1;
                continue;
            }
            result.row_groups_scanned += 1;

            let mut batch = Vec::new();
            for idx in 0..group.num_rows {
                let row = group.row(idx);
                if !predicates.iter().all(|p| p.matches(&row)) {
                    continue;
                }
                let row = if projection.is_empty() {
                    row
                } else {
                    projection
                        .iter()
                        .map(|col| {
                            row.get(*col).cloned().ok_or_else(|| {
                                DbError::protocol("Projected column out of range")
                                    .with_field("column", col)
                                    .with_field("num_columns", row.len())
                            })
                        })
                        .collect::<Result<Vec<_>>>()?
                };
                batch.push(Value::Tuple(row));
            }
            result.batches.push(batch);
        }

        Ok(result)
    }

    fn codec(&self) -> &dyn WireCodec {
        self.codec.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::wire::JsonWireCodec;

    fn store_with_rows(n: i64) -> MemoryColumnarStore {
        let store = MemoryColumnarStore::new(Arc::new(JsonWireCodec), 10);
        let rows: Vec<_> = (0..n)
            .map(|i| Value::tuple([Value::int64(i), Value::utf8(format!("r{i}"))]))
            .collect();
        let payload = store.codec().encode_values(&rows).unwrap();
        assert_eq!(n as usize, store.write("t", payload).unwrap());
        store
    }

    #[test]
    fn row_groups_pruned_by_min_max() {
        let store = store_with_rows(35);
        assert_eq!(Some(4), store.num_row_groups("t"));

        let preds = [ScanPredicate {
            column: 0,
            op: CompareOp::GtEq,
            value: ScalarValue::Int64(25),
        }];
        let result = store.scan("t", &preds, &[1]).unwrap();

        // Groups [0,10) and [10,20) pruned, [20,30) and [30,35) scanned.
        assert_eq!(2, result.row_groups_pruned);
        assert_eq!(2, result.row_groups_scanned);

        let rows: Vec<_> = result.batches.into_iter().flatten().collect();
        assert_eq!(10, rows.len());
        assert_eq!(Value::tuple([Value::utf8("r25")]), rows[0]);
    }

    #[test]
    fn eq_predicate() {
        let store = store_with_rows(35);
        let preds = [ScanPredicate {
            column: 0,
            op: CompareOp::Eq,
            value: ScalarValue::Int64(12),
        }];
        let result = store.scan("t", &preds, &[]).unwrap();
        assert_eq!(3, result.row_groups_pruned);
        let rows: Vec<_> = result.batches.into_iter().flatten().collect();
        assert_eq!(
            vec![Value::tuple([Value::int64(12), Value::utf8("r12")])],
            rows
        );
    }

    #[test]
    fn missing_table() {
        let store = MemoryColumnarStore::new(Arc::new(JsonWireCodec), 10);
        let err = store.scan("nope", &[], &[]).unwrap_err();
        assert_eq!(dagflow_error::ErrorKind::Resource, err.kind());
    }
}
