use std::sync::Arc;

use dagflow_error::{DbError, Result, ResultExt};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use super::builder::PlanBuilder;
use super::{BoxedOperator, ExecutionContext};
use crate::plan::dag::Dag;
use crate::plan::record::load_plan;
use crate::types::TypeTable;
use crate::value::Value;

/// Drives operator trees to completion.
///
/// The executor is the only place errors are turned into teardown: when any
/// call on the tree fails the root is closed before the error is returned.
#[derive(Debug, Clone)]
pub struct Executor {
    ctx: ExecutionContext,
}

impl Executor {
    pub fn new(ctx: ExecutionContext) -> Self {
        Executor { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn build(&self, dag: &Dag) -> Result<BoxedOperator> {
        PlanBuilder::from_context(&self.ctx).build(dag)
    }

    /// Run an already built tree, passing every output tuple to `f`.
    ///
    /// Returns the number of tuples produced.
    pub fn run_with<F>(&self, root: &mut BoxedOperator, mut f: F) -> Result<usize>
    where
        F: FnMut(Value) -> Result<()>,
    {
        root.open(&self.ctx)?;
        tracing::trace!(root = root.name(), "opened plan");

        let mut count = 0;
        let pulled = (|| -> Result<()> {
            while let Some(v) = root.next()? {
                count += 1;
                f(v)?;
            }
            Ok(())
        })();

        match pulled {
            Ok(()) => {
                root.close()?;
                tracing::debug!(root = root.name(), count, "plan finished");
                Ok(count)
            }
            Err(e) => {
                if let Err(close_err) = root.close() {
                    tracing::warn!(%close_err, "failed to close plan after error");
                }
                Err(e)
            }
        }
    }

    pub fn run(&self, root: &mut BoxedOperator) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        self.run_with(root, |v| {
            out.push(v);
            Ok(())
        })?;
        Ok(out)
    }

    /// Build and run a plan, collecting its output.
    pub fn execute(&self, dag: &Dag) -> Result<Vec<Value>> {
        let mut root = self.build(dag)?;
        self.run(&mut root)
    }

    /// Load a plan stored as a JSON record through the configured filesystem
    /// and execute it.
    pub fn execute_saved(&self, path: &str, types: &TypeTable) -> Result<Vec<Value>> {
        let fs = self
            .ctx
            .filesystem
            .as_ref()
            .ok_or_else(|| DbError::resource("No filesystem configured"))?;
        let dag = load_plan(fs.as_ref(), path, types)?;
        self.execute(&dag)
    }

    /// Execute the plan once per worker, all workers running concurrently.
    ///
    /// Each worker gets its own index and the worker count as the top level
    /// parameters. Outputs are returned in worker order.
    pub fn execute_workers(&self, dag: &Dag, num_workers: usize) -> Result<Vec<Vec<Value>>> {
        if num_workers == 0 {
            return Err(DbError::protocol("Number of workers must be greater than zero"));
        }
        // Workers block on each other during exchanges, so each needs its own
        // thread.
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|idx| format!("dagflow-worker-{idx}"))
            .build()
            .context("Failed to build worker pool")?;

        let slots: Vec<Arc<Mutex<Option<Result<Vec<Value>>>>>> =
            (0..num_workers).map(|_| Arc::new(Mutex::new(None))).collect();

        pool.scope(|scope| {
            for (worker, slot) in slots.iter().enumerate() {
                let executor = Executor::new(self.ctx.clone().with_worker(worker, num_workers));
                let slot = slot.clone();
                scope.spawn(move |_| {
                    let result = executor.execute(dag);
                    if let Err(e) = &result {
                        tracing::warn!(worker, %e, "worker failed");
                    }
                    *slot.lock() = Some(result);
                });
            }
        });

        slots
            .into_iter()
            .map(|slot| -> Result<Vec<Value>> {
                let result = slot.lock().take();
                result.ok_or_else(|| DbError::new("Worker did not complete"))?
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use dagflow_error::ErrorKind;

    use super::*;
    use crate::column::TupleSchema;
    use crate::execution::Operator;
    use crate::functions::FunctionRegistry;
    use crate::plan::kind::{OperatorKind, RangeParams};
    use crate::plan::operator::DagOperator;
    use crate::plan::record::save_plan;
    use crate::runtime::filesystem::MemoryFileSystem;
    use crate::testutil::{VecSource, leading_ints, test_context, test_context_with_functions};

    fn range_plan(to: i64) -> Dag {
        let mut dag = Dag::new();
        dag.add_operator(DagOperator::new(
            OperatorKind::RangeSource(RangeParams { from: 0, to, step: 1 }),
            TupleSchema::default(),
        ))
        .unwrap();
        dag
    }

    #[test]
    fn execute_range() {
        let executor = Executor::new(test_context());
        let out = executor.execute(&range_plan(4)).unwrap();
        assert_eq!(vec![0, 1, 2, 3], leading_ints(&out));
    }

    #[derive(Debug)]
    struct FailingNext {
        source: VecSource,
    }

    impl Operator for FailingNext {
        fn name(&self) -> &'static str {
            "failing_next"
        }

        fn open(&mut self, ctx: &ExecutionContext) -> Result<()> {
            self.source.open(ctx)
        }

        fn next(&mut self) -> Result<Option<Value>> {
            Err(DbError::resource("read failed"))
        }

        fn close(&mut self) -> Result<()> {
            self.source.close()
        }
    }

    #[test]
    fn closes_on_error() {
        let source = VecSource::ints([1]);
        let counts = source.counts();
        let mut root: BoxedOperator = Box::new(FailingNext { source });

        let err = Executor::new(test_context()).run(&mut root).unwrap_err();
        assert_eq!(ErrorKind::Resource, err.kind());
        assert_eq!(1, counts.opens());
        assert_eq!(1, counts.closes());
    }

    #[test]
    fn execute_saved_plan() {
        let fs = Arc::new(MemoryFileSystem::new());
        save_plan(fs.as_ref(), "plans/range.json", &range_plan(3)).unwrap();

        let executor = Executor::new(test_context_with_functions(FunctionRegistry::new()).with_filesystem(fs));
        let out = executor
            .execute_saved("plans/range.json", &TypeTable::new())
            .unwrap();
        assert_eq!(vec![0, 1, 2], leading_ints(&out));
    }

    #[test]
    fn workers_get_own_parameters() {
        let mut dag = Dag::new();
        dag.add_operator(DagOperator::new(
            OperatorKind::ParameterLookup(crate::plan::kind::ParameterParams { index: 0 }),
            TupleSchema::default(),
        ))
        .unwrap();

        let out = Executor::new(test_context()).execute_workers(&dag, 3).unwrap();
        let workers: Vec<Vec<i64>> = out.iter().map(|v| leading_ints(v)).collect();
        assert_eq!(vec![vec![0], vec![1], vec![2]], workers);
    }
}
