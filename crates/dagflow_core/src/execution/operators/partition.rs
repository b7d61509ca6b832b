use std::collections::VecDeque;

use dagflow_error::{DbError, Result};

use crate::config::PartitionBlockPolicy;
use crate::execution::util::{drain_with, read_single_scalar};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::plan::kind::PartitionParams;
use crate::value::{ArrayValue, GrowableArray, Value};

/// Partition a tuple belongs to, from its leading field.
///
/// Every worker must agree on this, so it uses the stable hash.
pub fn partition_of(row: &Value, seed: u64, fanout: usize) -> Result<usize> {
    if fanout == 0 {
        return Err(DbError::protocol("Partition fanout must be greater than zero"));
    }
    let key = row.field(0)?;
    Ok((key.stable_hash(seed) % fanout as u64) as usize)
}

/// Per partition storage while consuming input.
enum Blocks {
    Fixed {
        capacity: usize,
        full: Vec<Vec<Vec<Value>>>,
        current: Vec<Vec<Value>>,
    },
    Growable(Vec<GrowableArray>),
}

impl Blocks {
    fn new(policy: PartitionBlockPolicy, fanout: usize) -> Self {
        match policy {
            PartitionBlockPolicy::Fixed { capacity } => Blocks::Fixed {
                capacity,
                full: vec![Vec::new(); fanout],
                current: vec![Vec::new(); fanout],
            },
            PartitionBlockPolicy::Growable => {
                Blocks::Growable((0..fanout).map(|_| GrowableArray::new()).collect())
            }
        }
    }

    fn push(&mut self, partition: usize, row: Value) {
        match self {
            Blocks::Fixed {
                capacity,
                full,
                current,
            } => {
                let block = &mut current[partition];
                if block.capacity() == 0 {
                    block.reserve_exact(*capacity);
                }
                block.push(row);
                if block.len() == *capacity {
                    full[partition].push(std::mem::take(block));
                }
            }
            Blocks::Growable(arrays) => arrays[partition].push(row),
        }
    }

    /// Output tuples `(partition, block)`, partition by partition.
    ///
    /// Every partition produces at least one block, possibly empty.
    fn into_output(self) -> VecDeque<Value> {
        let out_row = |p: usize, block: ArrayValue| {
            Value::tuple([Value::int64(p as i64), Value::Array(block)])
        };
        let mut out = VecDeque::new();
        match self {
            Blocks::Fixed { full, current, .. } => {
                for (p, (full, current)) in full.into_iter().zip(current).enumerate() {
                    let had_full = !full.is_empty();
                    for block in full {
                        out.push_back(out_row(p, ArrayValue::from_values(block)));
                    }
                    if !current.is_empty() || !had_full {
                        out.push_back(out_row(p, ArrayValue::from_values(current)));
                    }
                }
            }
            Blocks::Growable(arrays) => {
                for (p, array) in arrays.into_iter().enumerate() {
                    out.push_back(out_row(p, array.into_array()));
                }
            }
        }
        out
    }
}

/// Hash partitions the data input (port 0) into a number of partitions read
/// from the arity input (port 1).
///
/// All input is consumed before the first output tuple. Each output tuple is
/// `(partition, array of rows)`.
#[derive(Debug)]
pub struct PhysicalPartition {
    data: BoxedOperator,
    fanout: BoxedOperator,
    params: PartitionParams,
    output: VecDeque<Value>,
}

impl PhysicalPartition {
    pub fn new(data: BoxedOperator, fanout: BoxedOperator, params: PartitionParams) -> Self {
        PhysicalPartition {
            data,
            fanout,
            params,
            output: VecDeque::new(),
        }
    }
}

impl Operator for PhysicalPartition {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let fanout = read_single_scalar(&mut self.fanout, ctx)?;
        if fanout == 0 {
            return Err(DbError::protocol("Partition fan-out must be greater than zero"));
        }
        let seed = self.params.seed.unwrap_or(ctx.config.partition_seed);
        let policy = self
            .params
            .policy
            .unwrap_or_else(|| ctx.config.default_block_policy());

        let mut blocks = Blocks::new(policy, fanout);
        let mut num_rows = 0;
        drain_with(&mut self.data, ctx, |row| {
            let p = partition_of(&row, seed, fanout)?;
            blocks.push(p, row);
            num_rows += 1;
            Ok(())
        })?;

        self.output = blocks.into_output();
        tracing::debug!(fanout, num_rows, blocks = self.output.len(), ?policy, "partitioned input");
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.output.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.output.clear();
        Ok(())
    }
}
