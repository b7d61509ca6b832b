//! Maps that run a nested plan once per input tuple.
//!
//! The input tuple is parameter 0 of the nested plan, which must produce
//! exactly one tuple.

use std::sync::Arc;

use dagflow_error::{DbError, Result, ResultExt};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::execution::builder::PlanBuilder;
use crate::execution::util::{drain, drain_with};
use crate::execution::{BoxedOperator, ExecutionContext, Operator};
use crate::plan::dag::Dag;
use crate::plan::kind::Parallelism;
use crate::value::Value;

fn exactly_one(mut values: Vec<Value>) -> Result<Value> {
    if values.len() != 1 {
        return Err(DbError::protocol("Nested plan of a parallel map must produce one tuple")
            .with_field("num_tuples", values.len()));
    }
    values
        .pop()
        .ok_or_else(|| DbError::new("Missing nested plan output"))
}

fn frame(ctx: &ExecutionContext, row: Value) -> ExecutionContext {
    ctx.with_parameters(vec![row])
}

/// Runs the nested plan for every input tuple on the calling thread.
#[derive(Debug)]
pub struct PhysicalParallelMap {
    input: BoxedOperator,
    inner: BoxedOperator,
    output: std::vec::IntoIter<Value>,
}

impl PhysicalParallelMap {
    pub fn new(input: BoxedOperator, inner: BoxedOperator) -> Self {
        PhysicalParallelMap {
            input,
            inner,
            output: Vec::new().into_iter(),
        }
    }
}

impl Operator for PhysicalParallelMap {
    fn name(&self) -> &'static str {
        "parallel_map"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let rows = drain(&mut self.input, ctx)?;
        let mut output = Vec::with_capacity(rows.len());
        for row in rows {
            let values = drain(&mut self.inner, &frame(ctx, row))?;
            output.push(exactly_one(values)?);
        }
        self.output = output.into_iter();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.output.next())
    }

    fn close(&mut self) -> Result<()> {
        self.output = Vec::new().into_iter();
        Ok(())
    }
}

type Slot = Arc<Mutex<Option<Result<Value>>>>;

/// Runs the nested plan for every input tuple on a thread pool.
///
/// Input is pulled on the calling thread. An output slot is reserved right
/// before each task is spawned, so the output order matches the input order
/// no matter which task finishes first. Every task is joined before the
/// first output tuple is returned.
#[derive(Debug)]
pub struct PhysicalParallelMapPool {
    input: BoxedOperator,
    inner: Arc<Dag>,
    parallelism: Parallelism,
    pool: Option<Arc<ThreadPool>>,
    output: std::vec::IntoIter<Value>,
}

impl PhysicalParallelMapPool {
    pub fn new(input: BoxedOperator, inner: Arc<Dag>, parallelism: Parallelism) -> Self {
        PhysicalParallelMapPool {
            input,
            inner,
            parallelism,
            pool: None,
            output: Vec::new().into_iter(),
        }
    }

    fn num_threads(&self, ctx: &ExecutionContext) -> Result<usize> {
        match self.parallelism {
            Parallelism::Fixed(n) => Ok(n),
            Parallelism::RuntimeWorkers => Ok(ctx.config.num_workers.max(1)),
            Parallelism::Unresolved => Err(DbError::plan(
                "Parallelism of a parallel map was never resolved",
            )),
        }
    }

    fn pool(&mut self, ctx: &ExecutionContext) -> Result<Arc<ThreadPool>> {
        if let Some(pool) = &self.pool {
            return Ok(pool.clone());
        }
        let num_threads = self.num_threads(ctx)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("dagflow-map-{idx}"))
            .build()
            .context("Failed to build thread pool for parallel map")?;
        tracing::debug!(num_threads, "created parallel map pool");
        let pool = Arc::new(pool);
        self.pool = Some(pool.clone());
        Ok(pool)
    }
}

fn run_task(dag: &Dag, ctx: &ExecutionContext) -> Result<Value> {
    let mut root = PlanBuilder::from_context(ctx).build(dag)?;
    exactly_one(drain(&mut root, ctx)?)
}

impl Operator for PhysicalParallelMapPool {
    fn name(&self) -> &'static str {
        "parallel_map_pool"
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let pool = self.pool(ctx)?;
        let inner = self.inner.clone();
        let input = &mut self.input;
        let mut slots: Vec<Slot> = Vec::new();

        let pulled = pool.in_place_scope(|scope| {
            drain_with(input, ctx, |row| {
                let slot: Slot = Arc::new(Mutex::new(None));
                slots.push(slot.clone());
                let task_ctx = frame(ctx, row);
                let dag = inner.clone();
                scope.spawn(move |_| {
                    let result = run_task(&dag, &task_ctx);
                    *slot.lock() = Some(result);
                });
                Ok(())
            })
        });
        pulled?;

        let mut output = Vec::with_capacity(slots.len());
        for slot in slots {
            let result = slot
                .lock()
                .take()
                .ok_or_else(|| DbError::new("Parallel map task did not complete"))?;
            output.push(result?);
        }
        tracing::debug!(tasks = output.len(), "joined parallel map tasks");
        self.output = output.into_iter();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.output.next())
    }

    fn close(&mut self) -> Result<()> {
        self.output = Vec::new().into_iter();
        Ok(())
    }
}
