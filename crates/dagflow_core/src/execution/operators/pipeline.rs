//! Operators owning a nested plan that runs once per input frame.
//!
//! A frame is one tuple pulled from each input, advanced in lockstep. The
//! frame's values become the nested plan's parameters. Without inputs the
//! nested plan runs exactly once with the parameters of the enclosing plan.

use std::collections::VecDeque;
use std::sync::Arc;

use dagflow_error::{DbError, Result, ResultExt};

use crate::execution::util::{close_all, open_all};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::plan::dag::Dag;
use crate::runtime::emitter::{InterpretedUnit, LoadableUnit};
use crate::value::Value;

#[derive(Debug)]
struct Frames {
    inputs: Vec<BoxedOperator>,
    parent: Option<Arc<[Value]>>,
    done: bool,
}

impl Frames {
    fn new(inputs: Vec<BoxedOperator>) -> Self {
        Frames {
            inputs,
            parent: None,
            done: false,
        }
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        open_all(&mut self.inputs, ctx)?;
        self.parent = Some(ctx.parameters.clone());
        self.done = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Arc<[Value]>>> {
        if self.done {
            return Ok(None);
        }
        if self.inputs.is_empty() {
            self.done = true;
            return Ok(self.parent.clone());
        }

        let mut frame = Vec::with_capacity(self.inputs.len());
        for input in &mut self.inputs {
            match input.next()? {
                Some(v) => frame.push(v),
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
        Ok(Some(Arc::from(frame)))
    }

    fn close(&mut self) -> Result<()> {
        self.parent = None;
        close_all(&mut self.inputs)
    }
}

/// Streams the output of the nested plan for every frame.
///
/// The nested operator tree is built once and reopened per frame.
#[derive(Debug)]
pub struct PhysicalPipeline {
    frames: Frames,
    inner: BoxedOperator,
    ctx: Option<ExecutionContext>,
    inner_open: bool,
}

impl PhysicalPipeline {
    pub fn new(inputs: Vec<BoxedOperator>, inner: BoxedOperator) -> Self {
        PhysicalPipeline {
            frames: Frames::new(inputs),
            inner,
            ctx: None,
            inner_open: false,
        }
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.inner_open {
            self.inner_open = false;
            self.inner.close()?;
        }
        Ok(())
    }
}

impl Operator for PhysicalPipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.frames.open(ctx)?;
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if self.inner_open {
                if let Some(v) = self.inner.next()? {
                    return Ok(Some(v));
                }
                self.close_inner()?;
            }

            let Some(frame) = self.frames.next_frame()? else {
                return Ok(None);
            };
            let ctx = self
                .ctx
                .as_ref()
                .ok_or_else(|| DbError::protocol("Pipeline pulled before open"))?
                .with_parameters(frame);
            self.inner.open(&ctx)?;
            self.inner_open = true;
        }
    }

    fn close(&mut self) -> Result<()> {
        let inner = self.close_inner();
        let frames = self.frames.close();
        self.ctx = None;
        inner.and(frames)
    }
}

/// Runs every frame through a loadable unit.
///
/// Frames and results cross the unit boundary in serialized form. When no
/// unit was emitted under the pipeline's function name, the nested plan is
/// interpreted behind the same interface.
#[derive(Debug)]
pub struct PhysicalCompiledPipeline {
    frames: Frames,
    function_name: String,
    fallback: Arc<Dag>,
    unit: Option<Arc<dyn LoadableUnit>>,
    ctx: Option<ExecutionContext>,
    buffered: VecDeque<Value>,
}

impl PhysicalCompiledPipeline {
    pub fn new(inputs: Vec<BoxedOperator>, function_name: impl Into<String>, fallback: Arc<Dag>) -> Self {
        PhysicalCompiledPipeline {
            frames: Frames::new(inputs),
            function_name: function_name.into(),
            fallback,
            unit: None,
            ctx: None,
            buffered: VecDeque::new(),
        }
    }

    fn run_frame(&mut self, frame: &[Value]) -> Result<()> {
        let (Some(unit), Some(ctx)) = (&self.unit, &self.ctx) else {
            return Err(DbError::protocol("Compiled pipeline pulled before open"));
        };
        let inputs = ctx.codec.encode_values(frame)?;
        let result = unit
            .execute(&inputs)
            .context_fn(|| format!("Failed to execute unit '{}'", self.function_name))?;
        let decoded = ctx.codec.decode_values(&result);
        unit.free_result(result);
        self.buffered.extend(decoded?);
        Ok(())
    }
}

impl Operator for PhysicalCompiledPipeline {
    fn name(&self) -> &'static str {
        "compiled_pipeline"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let unit = match ctx.units.get(&self.function_name) {
            Some(unit) => unit.clone(),
            None => {
                tracing::debug!(function = %self.function_name, "no emitted unit, interpreting nested plan");
                Arc::new(InterpretedUnit::new(self.fallback.clone(), ctx.clone())) as Arc<dyn LoadableUnit>
            }
        };
        self.frames.open(ctx)?;
        self.unit = Some(unit);
        self.ctx = Some(ctx.clone());
        self.buffered.clear();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(v) = self.buffered.pop_front() {
                return Ok(Some(v));
            }
            let Some(frame) = self.frames.next_frame()? else {
                return Ok(None);
            };
            self.run_frame(&frame)?;
        }
    }

    fn close(&mut self) -> Result<()> {
        self.buffered.clear();
        self.unit = None;
        self.ctx = None;
        self.frames.close()
    }
}
