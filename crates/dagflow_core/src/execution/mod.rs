//! Pull based execution of plans.
//!
//! Every operator follows the same three method protocol:
//!
//! - `open` opens upstream operators and builds whatever in-memory state the
//!   operator needs. An `open` that fails leaves the operator closed.
//! - `next` returns the next output tuple, or `None` once exhausted.
//! - `close` releases state and closes upstream operators exactly once per
//!   successful `open`.
//!
//! Errors are never swallowed. The driver (`Executor`) is responsible for
//! closing the tree when any call fails.

pub mod builder;
pub mod discipline;
pub mod executor;
pub mod key;
pub mod operators;
pub mod util;

use std::fmt::Debug;
use std::sync::Arc;

use dagflow_error::{DbError, Result};
use hashbrown::HashMap;

use crate::config::ExecutionConfig;
use crate::functions::FunctionRegistry;
use crate::runtime::emitter::LoadableUnit;
use crate::runtime::exchange::ExchangeTransport;
use crate::runtime::filesystem::FileSystem;
use crate::runtime::store::ColumnarStore;
use crate::value::Value;
use crate::value::wire::{JsonWireCodec, WireCodec};

pub use builder::PlanBuilder;
pub use executor::Executor;

pub trait Operator: Debug + Send {
    fn name(&self) -> &'static str;

    fn open(&mut self, ctx: &ExecutionContext) -> Result<()>;

    fn next(&mut self) -> Result<Option<Value>>;

    fn close(&mut self) -> Result<()>;
}

pub type BoxedOperator = Box<dyn Operator>;

/// Everything an operator can reach while executing.
///
/// Cheap to clone, nested plans get a clone with their own parameters.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub config: Arc<ExecutionConfig>,
    pub functions: Arc<FunctionRegistry>,
    /// Values read by `ParameterLookup`.
    ///
    /// For a top level plan these are the worker index and worker count. For
    /// nested plans they're the values of the current input frame.
    pub parameters: Arc<[Value]>,
    pub worker_index: usize,
    pub num_workers: usize,
    pub codec: Arc<dyn WireCodec>,
    pub store: Option<Arc<dyn ColumnarStore>>,
    pub transport: Option<Arc<dyn ExchangeTransport>>,
    pub filesystem: Option<Arc<dyn FileSystem>>,
    /// Loadable units for compiled pipelines, keyed by function name.
    pub units: Arc<HashMap<String, Arc<dyn LoadableUnit>>>,
}

impl ExecutionContext {
    pub fn new(config: ExecutionConfig, functions: FunctionRegistry) -> Self {
        let num_workers = config.num_workers;
        ExecutionContext {
            config: Arc::new(config),
            functions: Arc::new(functions),
            parameters: Arc::from(worker_parameters(0, num_workers)),
            worker_index: 0,
            num_workers,
            codec: Arc::new(JsonWireCodec),
            store: None,
            transport: None,
            filesystem: None,
            units: Arc::new(HashMap::new()),
        }
    }

    /// Set which worker this context executes for.
    pub fn with_worker(mut self, worker_index: usize, num_workers: usize) -> Self {
        self.worker_index = worker_index;
        self.num_workers = num_workers;
        self.parameters = Arc::from(worker_parameters(worker_index, num_workers));
        self
    }

    pub fn with_parameters(&self, parameters: impl Into<Arc<[Value]>>) -> Self {
        ExecutionContext {
            parameters: parameters.into(),
            ..self.clone()
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ColumnarStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ExchangeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_filesystem(mut self, filesystem: Arc<dyn FileSystem>) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    pub fn with_units(mut self, units: HashMap<String, Arc<dyn LoadableUnit>>) -> Self {
        self.units = Arc::new(units);
        self
    }

    pub fn parameter(&self, index: usize) -> Result<&Value> {
        self.parameters.get(index).ok_or_else(|| {
            DbError::protocol("Parameter index out of range")
                .with_field("index", index)
                .with_field("num_parameters", self.parameters.len())
        })
    }

    pub fn store(&self) -> Result<&Arc<dyn ColumnarStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| DbError::resource("No columnar store configured"))
    }

    pub fn transport(&self) -> Result<&Arc<dyn ExchangeTransport>> {
        self.transport
            .as_ref()
            .ok_or_else(|| DbError::resource("No exchange transport configured"))
    }
}

fn worker_parameters(worker_index: usize, num_workers: usize) -> Vec<Value> {
    vec![
        Value::int64(worker_index as i64),
        Value::int64(num_workers as i64),
    ]
}
