//! Structured records for plans.
//!
//! Every operator kind converts to and from an `OperatorRecord` keyed by its
//! kind tag. Kind specific parameters live in a string keyed map so that the
//! vocabulary can be extended without changing the record layout.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use dagflow_error::{DbError, OptionExt, Result, ResultExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::dag::Dag;
use super::kind::{
    CompiledPipelineParams, ConstantParams, ExchangeParams, IndexRangeParams, JoinParams,
    KeyParams, KindTag, OperatorKind, ParallelMapParams, Parallelism, ParameterParams,
    ParquetParams, ParquetScanParams, PartitionParams, PatternParams, PipelineParams,
    RangeParams, SortParams, TopKParams, ZipParams,
};
use super::operator::{DagOperator, OperatorId};
use crate::column::{AttributeId, ColumnArena, FieldProperty, FieldType, TupleSchema};
use crate::runtime::filesystem::FileSystem;
use crate::types::{ArrayLayout, Type, TypeKind, TypeRef, TypeTable};
use crate::value::wire::WireValue;

pub const PLAN_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRecord {
    pub version: u32,
    pub num_attributes: u32,
    pub operators: Vec<OperatorRecord>,
    pub flows: Vec<FlowRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub id: u32,
    pub kind: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub output: Vec<FieldRecord>,
    #[serde(default)]
    pub read_set: Vec<u32>,
    #[serde(default)]
    pub write_set: Vec<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<DagRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    #[serde(rename = "type")]
    pub field_type: TypeRecord,
    pub attribute: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
    /// Element fields, only for array fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Vec<FieldRecord>>,
}

/// Record for a type, keyed by the type's kind tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeRecord {
    Atomic {
        name: String,
    },
    Array {
        element: Box<TypeRecord>,
        layout: String,
        num_dimensions: usize,
    },
    Tuple {
        fields: Vec<TypeRecord>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source: u32,
    pub source_port: usize,
    pub target: u32,
    pub target_port: usize,
}

impl TypeRecord {
    pub fn from_type(ty: &TypeRef) -> Self {
        match ty.as_ref() {
            Type::Atomic { name } => TypeRecord::Atomic { name: name.clone() },
            Type::Array {
                element,
                layout,
                num_dimensions,
            } => TypeRecord::Array {
                element: Box::new(Self::from_type(element)),
                layout: layout.as_str().to_string(),
                num_dimensions: *num_dimensions,
            },
            Type::Tuple { fields } => TypeRecord::Tuple {
                fields: fields.iter().map(Self::from_type).collect(),
            },
        }
    }

    pub fn to_type(&self, types: &TypeTable) -> Result<TypeRef> {
        match self {
            TypeRecord::Atomic { name } => Ok(types.atomic(name)),
            TypeRecord::Array {
                element,
                layout,
                num_dimensions,
            } => {
                let element = element.to_type(types)?;
                let layout: ArrayLayout = layout.parse()?;
                types.array(element, layout, *num_dimensions)
            }
            TypeRecord::Tuple { fields } => {
                let fields = fields
                    .iter()
                    .map(|f| f.to_type(types))
                    .collect::<Result<Vec<_>>>()?;
                Ok(types.tuple(fields))
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| DbError::new("Failed to encode parameter").with_field("error", e))
}

/// Typed access to the parameter map of a record.
struct ParamReader<'a> {
    kind: KindTag,
    params: &'a BTreeMap<String, serde_json::Value>,
}

impl ParamReader<'_> {
    fn get_opt<T: DeserializeOwned>(&self, name: &'static str) -> Result<Option<T>> {
        match self.params.get(name) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                DbError::plan("Invalid operator parameter")
                    .with_field("kind", self.kind)
                    .with_field("param", name)
                    .with_field("error", e)
            }),
        }
    }

    fn get<T: DeserializeOwned>(&self, name: &'static str) -> Result<T> {
        self.get_opt(name)?.ok_or_else(|| {
            DbError::plan("Missing operator parameter")
                .with_field("kind", self.kind)
                .with_field("param", name)
        })
    }

    fn range(&self) -> Result<RangeParams> {
        Ok(RangeParams {
            from: self.get("from")?,
            to: self.get("to")?,
            step: self.get("step")?,
        })
    }
}

fn write_params(kind: &OperatorKind) -> Result<(BTreeMap<String, serde_json::Value>, Option<&Dag>)> {
    let mut params = BTreeMap::new();
    let mut put = |name: &str, value: serde_json::Value| {
        params.insert(name.to_string(), value);
    };

    match kind {
        OperatorKind::Join(p) | OperatorKind::SemiJoin(p) | OperatorKind::AntiJoin(p) => {
            put("num_keys", p.num_keys.into())
        }
        OperatorKind::GroupBy(p)
        | OperatorKind::ReduceByKey(p)
        | OperatorKind::ReduceByKeyGrouped(p) => put("num_keys", p.num_keys.into()),
        OperatorKind::ReduceByIndex(p) => {
            put("min", p.min.into());
            put("max", p.max.into());
        }
        OperatorKind::Partition(p) => {
            if let Some(seed) = p.seed {
                put("seed", seed.into());
            }
            if let Some(policy) = &p.policy {
                put("policy", to_json(policy)?);
            }
        }
        OperatorKind::Sort(p) => put("key_column", p.key_column.into()),
        OperatorKind::TopK(p) => {
            put("n", p.n.into());
            put("key_column", p.key_column.into());
        }
        OperatorKind::Zip(p) => put("num_inputs", p.num_inputs.into()),
        OperatorKind::RangeSource(p) | OperatorKind::SplitRange(p) => {
            put("from", p.from.into());
            put("to", p.to.into());
            put("step", p.step.into());
        }
        OperatorKind::ParallelMap(p) | OperatorKind::ParallelMapPool(p) => {
            put("parallelism", p.parallelism.to_param_string().into())
        }
        OperatorKind::Pipeline(p) => put("num_inputs", p.num_inputs.into()),
        OperatorKind::CompiledPipeline(p) => {
            put("num_inputs", p.num_inputs.into());
            put("function_name", p.function_name.clone().into());
        }
        OperatorKind::ExpandPattern(p) => put("pattern", p.pattern.clone().into()),
        OperatorKind::ConstantTuple(p) => put("value", to_json(&WireValue::from(&p.value))?),
        OperatorKind::ParameterLookup(p) => put("index", p.index.into()),
        OperatorKind::MaterializeParquet(p) => put("path", p.path.clone().into()),
        OperatorKind::ParquetScan(p) => {
            put("path", p.path.clone().into());
            put("columns", to_json(&p.columns)?);
            put("predicates", to_json(&p.predicates)?);
        }
        OperatorKind::Exchange(p) => put("exchange_id", p.exchange_id.clone().into()),
        OperatorKind::Map
        | OperatorKind::Filter
        | OperatorKind::Reduce
        | OperatorKind::Cartesian
        | OperatorKind::RowScan
        | OperatorKind::ColumnScan
        | OperatorKind::SplitRowData
        | OperatorKind::SplitColumnData
        | OperatorKind::EnsureSingleTuple
        | OperatorKind::MaterializeRowVector
        | OperatorKind::MaterializeColumnChunks => (),
    }

    Ok((params, kind.nested()))
}

fn read_kind(record: &OperatorRecord, types: &TypeTable) -> Result<OperatorKind> {
    let tag: KindTag = record.kind.parse()?;
    let p = ParamReader {
        kind: tag,
        params: &record.params,
    };
    let inner = || -> Result<Box<Dag>> {
        let inner = record.inner.as_ref().required("nested plan")?;
        Ok(Box::new(Dag::from_record(inner, types)?))
    };

    let kind = match tag {
        KindTag::Map => OperatorKind::Map,
        KindTag::Filter => OperatorKind::Filter,
        KindTag::Join => OperatorKind::Join(JoinParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::SemiJoin => OperatorKind::SemiJoin(JoinParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::AntiJoin => OperatorKind::AntiJoin(JoinParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::GroupBy => OperatorKind::GroupBy(KeyParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::ReduceByKey => OperatorKind::ReduceByKey(KeyParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::ReduceByKeyGrouped => OperatorKind::ReduceByKeyGrouped(KeyParams {
            num_keys: p.get("num_keys")?,
        }),
        KindTag::ReduceByIndex => OperatorKind::ReduceByIndex(IndexRangeParams {
            min: p.get("min")?,
            max: p.get("max")?,
        }),
        KindTag::Reduce => OperatorKind::Reduce,
        KindTag::Partition => OperatorKind::Partition(PartitionParams {
            seed: p.get_opt("seed")?,
            policy: p.get_opt("policy")?,
        }),
        KindTag::Cartesian => OperatorKind::Cartesian,
        KindTag::Sort => OperatorKind::Sort(SortParams {
            key_column: p.get("key_column")?,
        }),
        KindTag::TopK => OperatorKind::TopK(TopKParams {
            n: p.get("n")?,
            key_column: p.get("key_column")?,
        }),
        KindTag::Zip => OperatorKind::Zip(ZipParams {
            num_inputs: p.get("num_inputs")?,
        }),
        KindTag::RangeSource => OperatorKind::RangeSource(p.range()?),
        KindTag::RowScan => OperatorKind::RowScan,
        KindTag::ColumnScan => OperatorKind::ColumnScan,
        KindTag::SplitRowData => OperatorKind::SplitRowData,
        KindTag::SplitColumnData => OperatorKind::SplitColumnData,
        KindTag::SplitRange => OperatorKind::SplitRange(p.range()?),
        KindTag::ParallelMap | KindTag::ParallelMapPool => {
            let parallelism: String = p.get("parallelism")?;
            let params = ParallelMapParams {
                inner: inner()?,
                parallelism: Parallelism::from_param_str(&parallelism)?,
            };
            if tag == KindTag::ParallelMap {
                OperatorKind::ParallelMap(params)
            } else {
                OperatorKind::ParallelMapPool(params)
            }
        }
        KindTag::Pipeline => OperatorKind::Pipeline(PipelineParams {
            inner: inner()?,
            num_inputs: p.get("num_inputs")?,
        }),
        KindTag::CompiledPipeline => OperatorKind::CompiledPipeline(CompiledPipelineParams {
            inner: inner()?,
            num_inputs: p.get("num_inputs")?,
            function_name: p.get("function_name")?,
        }),
        KindTag::ExpandPattern => OperatorKind::ExpandPattern(PatternParams {
            pattern: p.get("pattern")?,
        }),
        KindTag::ConstantTuple => {
            let wire: WireValue = p.get("value")?;
            OperatorKind::ConstantTuple(ConstantParams {
                value: wire.into_value()?,
            })
        }
        KindTag::ParameterLookup => OperatorKind::ParameterLookup(ParameterParams {
            index: p.get("index")?,
        }),
        KindTag::EnsureSingleTuple => OperatorKind::EnsureSingleTuple,
        KindTag::MaterializeRowVector => OperatorKind::MaterializeRowVector,
        KindTag::MaterializeColumnChunks => OperatorKind::MaterializeColumnChunks,
        KindTag::MaterializeParquet => OperatorKind::MaterializeParquet(ParquetParams {
            path: p.get("path")?,
        }),
        KindTag::ParquetScan => OperatorKind::ParquetScan(ParquetScanParams {
            path: p.get("path")?,
            columns: p.get_opt("columns")?.unwrap_or_default(),
            predicates: p.get_opt("predicates")?.unwrap_or_default(),
        }),
        KindTag::Exchange => OperatorKind::Exchange(ExchangeParams {
            exchange_id: p.get("exchange_id")?,
        }),
    };

    if kind.num_inputs() != record.num_inputs || kind.num_outputs() != record.num_outputs {
        return Err(DbError::plan("Record port counts don't match operator kind")
            .with_field("id", record.id)
            .with_field("kind", tag)
            .with_field("record_inputs", record.num_inputs)
            .with_field("kind_inputs", kind.num_inputs()));
    }

    Ok(kind)
}

fn write_fields(columns: &ColumnArena, schema: &TupleSchema) -> Result<Vec<FieldRecord>> {
    schema
        .fields
        .iter()
        .map(|id| {
            let field = columns.field(*id)?;
            let element = match &field.field_type {
                FieldType::Atomic(_) => None,
                FieldType::Array { element, .. } => Some(write_fields(columns, element)?),
            };
            Ok(FieldRecord {
                field_type: TypeRecord::from_type(field.field_type.type_ref()),
                attribute: field.attribute.0,
                properties: FieldProperty::ALL
                    .iter()
                    .filter(|p| field.properties.get(**p))
                    .map(|p| p.as_str().to_string())
                    .collect(),
                element,
            })
        })
        .collect()
}

fn read_fields(
    columns: &mut ColumnArena,
    records: &[FieldRecord],
    types: &TypeTable,
) -> Result<TupleSchema> {
    let mut fields = Vec::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        let ty = record.field_type.to_type(types)?;
        let field_type = match ty.kind() {
            TypeKind::Array => {
                let element = record
                    .element
                    .as_ref()
                    .required("array element fields")?;
                FieldType::Array {
                    ty,
                    element: read_fields(columns, element, types)?,
                }
            }
            TypeKind::Atomic | TypeKind::Tuple => FieldType::Atomic(ty),
        };

        let attr = columns.ensure_attribute(AttributeId(record.attribute));
        let field = columns.new_field(position, field_type, attr)?;
        for prop in &record.properties {
            columns.set_property(field, FieldProperty::from_name(prop)?, true)?;
        }
        fields.push(field);
    }
    Ok(TupleSchema { fields })
}

impl Dag {
    /// Convert to a record. Operators are listed in id order.
    pub fn to_record(&self) -> Result<DagRecord> {
        let mut operators = Vec::with_capacity(self.num_operators());
        for op in self.operators() {
            let (params, nested) = write_params(&op.kind)?;
            let inner = match nested {
                Some(nested) => Some(Box::new(nested.to_record()?)),
                None => None,
            };

            operators.push(OperatorRecord {
                id: op.id.0,
                kind: op.name().to_string(),
                num_inputs: op.num_inputs(),
                num_outputs: op.num_outputs(),
                output: write_fields(&self.columns, &op.output)?,
                read_set: op.read_set.iter().map(|a| a.0).collect(),
                write_set: op.write_set.iter().map(|a| a.0).collect(),
                params,
                code: op.code.clone(),
                inner,
            });
        }

        let flows = self
            .flows()
            .iter()
            .map(|f| FlowRecord {
                source: f.source.operator.0,
                source_port: f.source.port,
                target: f.target.operator.0,
                target_port: f.target.port,
            })
            .collect();

        Ok(DagRecord {
            version: PLAN_RECORD_VERSION,
            num_attributes: self.columns.num_attributes() as u32,
            operators,
            flows,
        })
    }

    /// Rebuild a plan from a record.
    ///
    /// Unknown kind tags, missing parameters and bad ports are plan errors.
    pub fn from_record(record: &DagRecord, types: &TypeTable) -> Result<Dag> {
        if record.version != PLAN_RECORD_VERSION {
            return Err(DbError::plan("Unsupported plan record version")
                .with_field("version", record.version)
                .with_field("supported", PLAN_RECORD_VERSION));
        }

        let mut dag = Dag::new();
        if record.num_attributes > 0 {
            dag.columns
                .ensure_attribute(AttributeId(record.num_attributes - 1));
        }

        for op_record in &record.operators {
            let kind = read_kind(op_record, types)?;
            let output = read_fields(&mut dag.columns, &op_record.output, types)?;
            let op = DagOperator {
                id: OperatorId(op_record.id),
                kind,
                output,
                read_set: op_record.read_set.iter().map(|a| AttributeId(*a)).collect(),
                write_set: op_record.write_set.iter().map(|a| AttributeId(*a)).collect(),
                code: op_record.code.clone(),
            };
            dag.insert_operator(op)?;
        }

        for flow in &record.flows {
            dag.connect(
                OperatorId(flow.source),
                flow.source_port,
                OperatorId(flow.target),
                flow.target_port,
            )?;
        }

        Ok(dag)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.to_record()?).context("Failed to serialize plan")
    }

    pub fn from_json(json: &str, types: &TypeTable) -> Result<Dag> {
        let record: DagRecord = serde_json::from_str(json)
            .map_err(|e| DbError::plan("Failed to parse plan record").with_field("error", e))?;
        Self::from_record(&record, types)
    }
}

/// Write a plan to a file.
pub fn save_plan(fs: &dyn FileSystem, path: &str, dag: &Dag) -> Result<()> {
    let json = dag.to_json()?;
    let mut file = fs.open_for_write(path)?;
    file.write_all(json.as_bytes())
        .context_fn(|| format!("Failed to write plan to '{path}'"))?;
    file.flush()?;
    Ok(())
}

/// Read a plan from a file.
pub fn load_plan(fs: &dyn FileSystem, path: &str, types: &TypeTable) -> Result<Dag> {
    let mut file = fs.open_for_read(path)?;
    let mut json = String::new();
    file.read_to_string(&mut json)
        .context_fn(|| format!("Failed to read plan from '{path}'"))?;
    Dag::from_json(&json, types)
}
