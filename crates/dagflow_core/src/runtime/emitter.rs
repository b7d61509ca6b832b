//! Lowering of compiled pipelines into loadable units.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dagflow_error::{DbError, Result};
use hashbrown::HashMap;

use crate::execution::{ExecutionContext, Executor};
use crate::pipeline::{PipelineGraph, partition_pipelines};
use crate::plan::dag::Dag;
use crate::plan::kind::OperatorKind;

/// An executable unit produced for one compiled pipeline.
///
/// Inputs are the encoded values of one frame, the output is the encoded
/// values the nested plan produced for that frame. Every result returned by
/// `execute` is handed back through `free_result` once it was decoded.
pub trait LoadableUnit: Debug + Send + Sync {
    fn execute(&self, inputs: &[u8]) -> Result<Bytes>;

    fn free_result(&self, result: Bytes);
}

pub trait PipelineEmitter: Debug {
    /// Lower the nested plan of a compiled pipeline.
    fn emit(&self, name: &str, dag: &Dag, pipelines: &PipelineGraph) -> Result<Arc<dyn LoadableUnit>>;
}

/// Emit a unit for every compiled pipeline in the plan, including ones in
/// nested plans. Units are keyed by function name.
pub fn emit_compiled_pipelines(
    dag: &Dag,
    emitter: &dyn PipelineEmitter,
) -> Result<HashMap<String, Arc<dyn LoadableUnit>>> {
    let mut units = HashMap::new();
    emit_recursive(dag, emitter, &mut units)?;
    Ok(units)
}

fn emit_recursive(
    dag: &Dag,
    emitter: &dyn PipelineEmitter,
    units: &mut HashMap<String, Arc<dyn LoadableUnit>>,
) -> Result<()> {
    for op in dag.operators() {
        if let Some(nested) = op.kind.nested() {
            emit_recursive(nested, emitter, units)?;
        }

        let OperatorKind::CompiledPipeline(params) = &op.kind else {
            continue;
        };
        if units.contains_key(&params.function_name) {
            return Err(DbError::plan("Duplicate compiled pipeline function name")
                .with_field("function_name", &params.function_name));
        }

        let pipelines = partition_pipelines(&params.inner)?;
        let unit = emitter.emit(&params.function_name, &params.inner, &pipelines)?;
        tracing::debug!(
            id = %op.id,
            function_name = %params.function_name,
            num_pipelines = pipelines.len(),
            "emitted compiled pipeline"
        );
        units.insert(params.function_name.clone(), unit);
    }
    Ok(())
}

/// Emitter producing units that interpret the nested plan in process.
#[derive(Debug, Clone)]
pub struct InterpretingEmitter {
    ctx: ExecutionContext,
}

impl InterpretingEmitter {
    pub fn new(ctx: ExecutionContext) -> Self {
        InterpretingEmitter { ctx }
    }
}

impl PipelineEmitter for InterpretingEmitter {
    fn emit(&self, _name: &str, dag: &Dag, _pipelines: &PipelineGraph) -> Result<Arc<dyn LoadableUnit>> {
        dag.validate()?;
        Ok(Arc::new(InterpretedUnit::new(
            Arc::new(dag.clone()),
            self.ctx.clone(),
        )))
    }
}

/// Runs a nested plan per call, with the decoded inputs as its parameters.
#[derive(Debug)]
pub struct InterpretedUnit {
    dag: Arc<Dag>,
    ctx: ExecutionContext,
    outstanding: AtomicUsize,
}

impl InterpretedUnit {
    pub fn new(dag: Arc<Dag>, ctx: ExecutionContext) -> Self {
        InterpretedUnit {
            dag,
            ctx,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Number of results not yet handed back with `free_result`.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl LoadableUnit for InterpretedUnit {
    fn execute(&self, inputs: &[u8]) -> Result<Bytes> {
        let parameters = self.ctx.codec.decode_values(inputs)?;
        let executor = Executor::new(self.ctx.with_parameters(parameters));
        let values = executor.execute(&self.dag)?;
        let result = self.ctx.codec.encode_values(&values)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(result)
    }

    fn free_result(&self, _result: Bytes) {
        let freed = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if freed.is_err() {
            tracing::warn!("freed a result that wasn't outstanding");
        }
    }
}
