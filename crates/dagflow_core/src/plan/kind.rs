use std::fmt;
use std::str::FromStr;

use dagflow_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use super::dag::Dag;
use crate::config::PartitionBlockPolicy;
use crate::runtime::store::ScanPredicate;
use crate::value::Value;
use crate::value::wire::BoundaryKind;

/// Generates the closed set of kind tags along with their record names.
macro_rules! kind_tags {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Tag identifying an operator kind.
        ///
        /// The string form is the vocabulary used by plan records.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum KindTag {
            $($variant,)*
        }

        impl KindTag {
            pub const ALL: &'static [KindTag] = &[$(KindTag::$variant,)*];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(KindTag::$variant => $name,)*
                }
            }
        }

        impl FromStr for KindTag {
            type Err = DbError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(KindTag::$variant),)*
                    other => Err(DbError::plan(format!("Unknown operator kind: {other}"))),
                }
            }
        }
    };
}

kind_tags! {
    Map => "map",
    Filter => "filter",
    Join => "join",
    SemiJoin => "semi_join",
    AntiJoin => "anti_join",
    GroupBy => "group_by",
    ReduceByKey => "reduce_by_key",
    ReduceByKeyGrouped => "reduce_by_key_grouped",
    ReduceByIndex => "reduce_by_index",
    Reduce => "reduce",
    Partition => "partition",
    Cartesian => "cartesian",
    Sort => "sort",
    TopK => "top_k",
    Zip => "zip",
    RangeSource => "range_source",
    RowScan => "row_scan",
    ColumnScan => "column_scan",
    SplitRowData => "split_row_data",
    SplitColumnData => "split_column_data",
    SplitRange => "split_range",
    ParallelMap => "parallel_map",
    ParallelMapPool => "parallel_map_pool",
    Pipeline => "pipeline",
    CompiledPipeline => "compiled_pipeline",
    ExpandPattern => "expand_pattern",
    ConstantTuple => "constant_tuple",
    ParameterLookup => "parameter_lookup",
    EnsureSingleTuple => "ensure_single_tuple",
    MaterializeRowVector => "materialize_row_vector",
    MaterializeColumnChunks => "materialize_column_chunks",
    MaterializeParquet => "materialize_parquet",
    ParquetScan => "parquet_scan",
    Exchange => "exchange",
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters for the join family. Keys are the leading `num_keys` fields of
/// both inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinParams {
    pub num_keys: usize,
}

/// Parameters for grouping operators. Keys are the leading `num_keys` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyParams {
    pub num_keys: usize,
}

/// Inclusive bounds of the integer key accepted by `ReduceByIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRangeParams {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionParams {
    /// Hash seed, falls back to the configured seed.
    pub seed: Option<u64>,
    /// Block policy, falls back to the configured policy.
    pub policy: Option<PartitionBlockPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortParams {
    pub key_column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopKParams {
    pub n: usize,
    pub key_column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipParams {
    pub num_inputs: usize,
}

/// Half-open integer range `[from, to)` walked with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeParams {
    pub from: i64,
    pub to: i64,
    pub step: i64,
}

impl RangeParams {
    /// Number of values in the range, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        let (from, to, step) = (self.from as i128, self.to as i128, self.step as i128);
        let len = if step > 0 && from < to {
            (to - from - 1) / step + 1
        } else if step < 0 && from > to {
            (from - to - 1) / -step + 1
        } else {
            0
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_at(&self, idx: usize) -> Result<i64> {
        let idx = i128::try_from(idx)
            .map_err(|_| DbError::plan(format!("Range index {idx} out of bounds")))?;
        let v = idx
            .checked_mul(self.step as i128)
            .and_then(|offset| offset.checked_add(self.from as i128))
            .and_then(|v| i64::try_from(v).ok());
        v.ok_or_else(|| {
            DbError::plan(format!(
                "Range value at index {idx} overflows for {}..{} step {}",
                self.from, self.to, self.step
            ))
        })
    }
}

/// Degree of parallelism for parallel maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Placeholder left by the planner, resolved by the parallelize pass.
    Unresolved,
    Fixed(usize),
    /// Use the worker count available at execution time.
    RuntimeWorkers,
}

impl Parallelism {
    pub fn to_param_string(&self) -> String {
        match self {
            Self::Unresolved => "unresolved".to_string(),
            Self::Fixed(n) => n.to_string(),
            Self::RuntimeWorkers => "runtime".to_string(),
        }
    }

    pub fn from_param_str(s: &str) -> Result<Self> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "runtime" => Ok(Self::RuntimeWorkers),
            other => match other.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Self::Fixed(n)),
                _ => Err(DbError::plan(format!("Invalid parallelism: {other}"))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelMapParams {
    /// Plan run once per input tuple. The tuple is available as parameter 0.
    pub inner: Box<Dag>,
    pub parallelism: Parallelism,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineParams {
    /// Plan run once per input frame. Frame values are the parameters.
    pub inner: Box<Dag>,
    pub num_inputs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPipelineParams {
    pub inner: Box<Dag>,
    pub num_inputs: usize,
    /// Name of the loadable unit implementing the pipeline.
    pub function_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternParams {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantParams {
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterParams {
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParquetParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetScanParams {
    pub path: String,
    /// Projected columns, empty for all.
    pub columns: Vec<usize>,
    pub predicates: Vec<ScanPredicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeParams {
    pub exchange_id: String,
}

/// Kind of an operator together with its kind specific parameters.
///
/// This is a closed set. Anything dispatching on the kind matches
/// exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    Map,
    Filter,
    Join(JoinParams),
    SemiJoin(JoinParams),
    AntiJoin(JoinParams),
    GroupBy(KeyParams),
    ReduceByKey(KeyParams),
    ReduceByKeyGrouped(KeyParams),
    ReduceByIndex(IndexRangeParams),
    Reduce,
    Partition(PartitionParams),
    Cartesian,
    Sort(SortParams),
    TopK(TopKParams),
    Zip(ZipParams),
    RangeSource(RangeParams),
    RowScan,
    ColumnScan,
    SplitRowData,
    SplitColumnData,
    SplitRange(RangeParams),
    ParallelMap(ParallelMapParams),
    ParallelMapPool(ParallelMapParams),
    Pipeline(PipelineParams),
    CompiledPipeline(CompiledPipelineParams),
    ExpandPattern(PatternParams),
    ConstantTuple(ConstantParams),
    ParameterLookup(ParameterParams),
    EnsureSingleTuple,
    MaterializeRowVector,
    MaterializeColumnChunks,
    MaterializeParquet(ParquetParams),
    ParquetScan(ParquetScanParams),
    Exchange(ExchangeParams),
}

impl OperatorKind {
    pub const fn tag(&self) -> KindTag {
        match self {
            Self::Map => KindTag::Map,
            Self::Filter => KindTag::Filter,
            Self::Join(_) => KindTag::Join,
            Self::SemiJoin(_) => KindTag::SemiJoin,
            Self::AntiJoin(_) => KindTag::AntiJoin,
            Self::GroupBy(_) => KindTag::GroupBy,
            Self::ReduceByKey(_) => KindTag::ReduceByKey,
            Self::ReduceByKeyGrouped(_) => KindTag::ReduceByKeyGrouped,
            Self::ReduceByIndex(_) => KindTag::ReduceByIndex,
            Self::Reduce => KindTag::Reduce,
            Self::Partition(_) => KindTag::Partition,
            Self::Cartesian => KindTag::Cartesian,
            Self::Sort(_) => KindTag::Sort,
            Self::TopK(_) => KindTag::TopK,
            Self::Zip(_) => KindTag::Zip,
            Self::RangeSource(_) => KindTag::RangeSource,
            Self::RowScan => KindTag::RowScan,
            Self::ColumnScan => KindTag::ColumnScan,
            Self::SplitRowData => KindTag::SplitRowData,
            Self::SplitColumnData => KindTag::SplitColumnData,
            Self::SplitRange(_) => KindTag::SplitRange,
            Self::ParallelMap(_) => KindTag::ParallelMap,
            Self::ParallelMapPool(_) => KindTag::ParallelMapPool,
            Self::Pipeline(_) => KindTag::Pipeline,
            Self::CompiledPipeline(_) => KindTag::CompiledPipeline,
            Self::ExpandPattern(_) => KindTag::ExpandPattern,
            Self::ConstantTuple(_) => KindTag::ConstantTuple,
            Self::ParameterLookup(_) => KindTag::ParameterLookup,
            Self::EnsureSingleTuple => KindTag::EnsureSingleTuple,
            Self::MaterializeRowVector => KindTag::MaterializeRowVector,
            Self::MaterializeColumnChunks => KindTag::MaterializeColumnChunks,
            Self::MaterializeParquet(_) => KindTag::MaterializeParquet,
            Self::ParquetScan(_) => KindTag::ParquetScan,
            Self::Exchange(_) => KindTag::Exchange,
        }
    }

    /// Number of input ports.
    pub fn num_inputs(&self) -> usize {
        match self {
            Self::RangeSource(_)
            | Self::ConstantTuple(_)
            | Self::ParameterLookup(_)
            | Self::ParquetScan(_) => 0,
            Self::Map
            | Self::Filter
            | Self::GroupBy(_)
            | Self::ReduceByKey(_)
            | Self::ReduceByKeyGrouped(_)
            | Self::ReduceByIndex(_)
            | Self::Reduce
            | Self::Sort(_)
            | Self::TopK(_)
            | Self::RowScan
            | Self::ColumnScan
            | Self::ParallelMap(_)
            | Self::ParallelMapPool(_)
            | Self::ExpandPattern(_)
            | Self::EnsureSingleTuple
            | Self::MaterializeRowVector
            | Self::MaterializeColumnChunks
            | Self::MaterializeParquet(_) => 1,
            // Data plus fan-out arity.
            Self::Partition(_) | Self::Exchange(_) => 2,
            Self::Join(_) | Self::SemiJoin(_) | Self::AntiJoin(_) | Self::Cartesian => 2,
            // Slice index and slice count.
            Self::SplitRange(_) => 2,
            // Data, slice index and slice count.
            Self::SplitRowData | Self::SplitColumnData => 3,
            Self::Zip(p) => p.num_inputs,
            Self::Pipeline(p) => p.num_inputs,
            Self::CompiledPipeline(p) => p.num_inputs,
        }
    }

    /// Number of output ports. Every kind currently produces a single stream.
    pub const fn num_outputs(&self) -> usize {
        1
    }

    /// If this operator must fully consume its input before producing
    /// output.
    pub const fn is_pipeline_breaker(&self) -> bool {
        matches!(
            self,
            Self::GroupBy(_)
                | Self::EnsureSingleTuple
                | Self::Reduce
                | Self::ParallelMap(_)
                | Self::ParallelMapPool(_)
                | Self::MaterializeRowVector
                | Self::MaterializeColumnChunks
                | Self::MaterializeParquet(_)
                | Self::Exchange(_)
        )
    }

    /// If a second `open` without a `close` reuses build side state.
    pub const fn caches_build_state(&self) -> bool {
        matches!(
            self,
            Self::Join(_)
                | Self::SemiJoin(_)
                | Self::AntiJoin(_)
                | Self::GroupBy(_)
                | Self::ReduceByKey(_)
        )
    }

    /// If the operator needs an embedded expression body.
    pub const fn requires_code(&self) -> bool {
        matches!(
            self,
            Self::Map
                | Self::Filter
                | Self::AntiJoin(_)
                | Self::ReduceByKey(_)
                | Self::ReduceByKeyGrouped(_)
                | Self::ReduceByIndex(_)
                | Self::Reduce
        )
    }

    /// How this operator's output crosses its boundary.
    pub const fn output_boundary(&self) -> BoundaryKind {
        match self {
            Self::Exchange(_) | Self::MaterializeParquet(_) | Self::CompiledPipeline(_) => {
                BoundaryKind::Serialized
            }
            _ => BoundaryKind::InProcess,
        }
    }

    /// Nested plan owned by this operator.
    pub fn nested(&self) -> Option<&Dag> {
        match self {
            Self::ParallelMap(p) | Self::ParallelMapPool(p) => Some(&p.inner),
            Self::Pipeline(p) => Some(&p.inner),
            Self::CompiledPipeline(p) => Some(&p.inner),
            _ => None,
        }
    }

    pub fn nested_mut(&mut self) -> Option<&mut Dag> {
        match self {
            Self::ParallelMap(p) | Self::ParallelMapPool(p) => Some(&mut p.inner),
            Self::Pipeline(p) => Some(&mut p.inner),
            Self::CompiledPipeline(p) => Some(&mut p.inner),
            _ => None,
        }
    }

    /// Check parameters that can be checked without looking at the rest of the
    /// plan.
    pub fn validate_params(&self) -> Result<()> {
        match self {
            Self::Join(p) | Self::SemiJoin(p) | Self::AntiJoin(p) if p.num_keys == 0 => {
                Err(DbError::plan("Join requires at least one key"))
            }
            Self::ReduceByIndex(p) if p.min > p.max => Err(DbError::plan(
                "Index range minimum greater than maximum",
            )
            .with_field("min", p.min)
            .with_field("max", p.max)),
            Self::RangeSource(p) | Self::SplitRange(p) if p.step == 0 => {
                Err(DbError::plan("Range step cannot be zero"))
            }
            Self::Zip(p) if p.num_inputs == 0 => Err(DbError::plan("Zip requires inputs")),
            Self::Partition(PartitionParams {
                policy: Some(PartitionBlockPolicy::Fixed { capacity: 0 }),
                ..
            }) => Err(DbError::plan("Partition block capacity cannot be zero")),
            Self::ExpandPattern(p) => crate::execution::operators::pattern::check_pattern(&p.pattern),
            Self::ParallelMap(p) | Self::ParallelMapPool(p)
                if matches!(p.parallelism, Parallelism::Fixed(0)) =>
            {
                Err(DbError::plan("Parallelism cannot be zero"))
            }
            _ => Ok(()),
        }
    }

    /// Short human readable rendering of the parameters.
    pub fn describe_params(&self) -> String {
        match self {
            Self::Join(p) | Self::SemiJoin(p) | Self::AntiJoin(p) => {
                format!("num_keys={}", p.num_keys)
            }
            Self::GroupBy(p) | Self::ReduceByKey(p) | Self::ReduceByKeyGrouped(p) => {
                format!("num_keys={}", p.num_keys)
            }
            Self::ReduceByIndex(p) => format!("min={}, max={}", p.min, p.max),
            Self::Partition(p) => {
                let seed = p.seed.map(|s| s.to_string()).unwrap_or_else(|| "default".into());
                let policy = p
                    .policy
                    .map(|p| p.to_setting_string())
                    .unwrap_or_else(|| "default".into());
                format!("seed={seed}, policy={policy}")
            }
            Self::Sort(p) => format!("key_column={}", p.key_column),
            Self::TopK(p) => format!("n={}, key_column={}", p.n, p.key_column),
            Self::Zip(p) => format!("num_inputs={}", p.num_inputs),
            Self::RangeSource(p) | Self::SplitRange(p) => {
                format!("from={}, to={}, step={}", p.from, p.to, p.step)
            }
            Self::ParallelMap(p) | Self::ParallelMapPool(p) => {
                format!("parallelism={}", p.parallelism.to_param_string())
            }
            Self::Pipeline(p) => format!("num_inputs={}", p.num_inputs),
            Self::CompiledPipeline(p) => {
                format!("num_inputs={}, function={}", p.num_inputs, p.function_name)
            }
            Self::ExpandPattern(p) => format!("pattern={:?}", p.pattern),
            Self::ConstantTuple(p) => format!("value={}", p.value),
            Self::ParameterLookup(p) => format!("index={}", p.index),
            Self::MaterializeParquet(p) => format!("path={:?}", p.path),
            Self::ParquetScan(p) => format!(
                "path={:?}, columns={:?}, predicates={}",
                p.path,
                p.columns,
                p.predicates.len()
            ),
            Self::Exchange(p) => format!("exchange_id={:?}", p.exchange_id),
            Self::Map
            | Self::Filter
            | Self::Reduce
            | Self::Cartesian
            | Self::RowScan
            | Self::ColumnScan
            | Self::SplitRowData
            | Self::SplitColumnData
            | Self::EnsureSingleTuple
            | Self::MaterializeRowVector
            | Self::MaterializeColumnChunks => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_round_trip() {
        for tag in KindTag::ALL {
            assert_eq!(*tag, tag.as_str().parse::<KindTag>().unwrap());
        }
    }

    #[test]
    fn unknown_tag_is_plan_error() {
        let err = "hash_everything".parse::<KindTag>().unwrap_err();
        assert_eq!(dagflow_error::ErrorKind::PlanMalformed, err.kind());
    }

    #[test]
    fn parameter_dependent_arity() {
        assert_eq!(4, OperatorKind::Zip(ZipParams { num_inputs: 4 }).num_inputs());
        assert_eq!(3, OperatorKind::SplitRowData.num_inputs());
        assert_eq!(0, OperatorKind::RangeSource(RangeParams { from: 0, to: 1, step: 1 }).num_inputs());
    }

    #[test]
    fn range_len() {
        assert_eq!(10, RangeParams { from: 0, to: 10, step: 1 }.len());
        assert_eq!(4, RangeParams { from: 0, to: 10, step: 3 }.len());
        assert_eq!(5, RangeParams { from: 10, to: 0, step: -2 }.len());
        assert_eq!(0, RangeParams { from: 5, to: 5, step: 1 }.len());
        assert_eq!(0, RangeParams { from: 5, to: 0, step: 1 }.len());
    }

    #[test]
    fn range_len_at_extremes() {
        let wide = RangeParams { from: -10, to: i64::MAX, step: 1 };
        assert_eq!((i64::MAX as u64 + 10) as usize, wide.len());
        assert_eq!(-10, wide.value_at(0).unwrap());
        assert_eq!(i64::MAX - 1, wide.value_at(wide.len() - 1).unwrap());

        let full = RangeParams { from: i64::MIN, to: i64::MAX, step: 1 };
        assert_eq!(u64::MAX as usize, full.len());

        let min_step = RangeParams { from: 0, to: -10, step: i64::MIN };
        assert_eq!(1, min_step.len());
        assert_eq!(0, min_step.value_at(0).unwrap());
        assert_eq!(i64::MIN, min_step.value_at(1).unwrap());
        min_step.value_at(2).unwrap_err();

        let down = RangeParams { from: i64::MAX, to: i64::MIN, step: i64::MIN };
        assert_eq!(2, down.len());
        assert_eq!(-1, down.value_at(1).unwrap());
    }

    #[test]
    fn parallelism_strings() {
        for p in [Parallelism::Unresolved, Parallelism::Fixed(8), Parallelism::RuntimeWorkers] {
            assert_eq!(p, Parallelism::from_param_str(&p.to_param_string()).unwrap());
        }
        Parallelism::from_param_str("0").unwrap_err();
    }
}
