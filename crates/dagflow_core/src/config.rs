use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use dagflow_error::{DbError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARTITION_BLOCK_CAPACITY: usize = 4096;

/// How the partition operator grows its per-partition storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PartitionBlockPolicy {
    /// Blocks hold at most `capacity` rows. A full block is queued as its own
    /// output tuple and a fresh block is started.
    Fixed { capacity: usize },
    /// A single block per partition whose capacity doubles on overflow.
    Growable,
}

impl FromStr for PartitionBlockPolicy {
    type Err = DbError;

    /// Parses `fixed`, `fixed:<capacity>` or `growable`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None if s == "fixed" => Ok(Self::Fixed {
                capacity: DEFAULT_PARTITION_BLOCK_CAPACITY,
            }),
            None if s == "growable" => Ok(Self::Growable),
            Some(("fixed", cap)) => {
                let capacity: usize = cap
                    .parse()
                    .map_err(|_| DbError::new(format!("Invalid block capacity: {cap}")))?;
                if capacity == 0 {
                    return Err(DbError::new("Block capacity must be greater than zero"));
                }
                Ok(Self::Fixed { capacity })
            }
            _ => Err(DbError::new(format!("Invalid partition block policy: {s}"))),
        }
    }
}

impl PartitionBlockPolicy {
    pub fn to_setting_string(&self) -> String {
        match self {
            Self::Fixed { capacity } => format!("fixed:{capacity}"),
            Self::Growable => "growable".to_string(),
        }
    }
}

/// Configuration for executing plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub num_workers: usize,
    pub partition_block_capacity: usize,
    pub partition_block_policy: PartitionBlockPolicy,
    pub partition_seed: u64,
    pub verify_call_discipline: bool,
    pub check_grouped_input: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            num_workers: num_cpus::get(),
            partition_block_capacity: DEFAULT_PARTITION_BLOCK_CAPACITY,
            partition_block_policy: PartitionBlockPolicy::Fixed {
                capacity: DEFAULT_PARTITION_BLOCK_CAPACITY,
            },
            partition_seed: 0,
            verify_call_discipline: cfg!(debug_assertions),
            check_grouped_input: false,
        }
    }
}

impl ExecutionConfig {
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get(&self, name: &str) -> Result<String> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();

        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        let val = (func.get)(&def_conf);
        (func.set)(&val, self)
    }

    pub fn reset_all(&mut self) {
        *self = Self::default();
    }

    /// Names and descriptions of every setting.
    pub fn settings() -> impl Iterator<Item = (&'static str, &'static str)> {
        GET_SET_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
    }

    /// Block policy to use for a partition operator that doesn't specify its
    /// own.
    ///
    /// A fixed policy picks up the configured capacity.
    pub fn default_block_policy(&self) -> PartitionBlockPolicy {
        match self.partition_block_policy {
            PartitionBlockPolicy::Fixed { .. } => PartitionBlockPolicy::Fixed {
                capacity: self.partition_block_capacity,
            },
            PartitionBlockPolicy::Growable => PartitionBlockPolicy::Growable,
        }
    }
}

struct SettingFunctions {
    set: fn(value: &str, conf: &mut ExecutionConfig) -> Result<()>,
    get: fn(conf: &ExecutionConfig) -> String,
    description: &'static str,
}

impl SettingFunctions {
    const fn new<S: ExecutionSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_str as _,
            get: S::get_as_string as _,
            description: S::DESCRIPTION,
        }
    }
}

fn insert_setting<S: ExecutionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<NumWorkers>(&mut map);
    insert_setting::<PartitionBlockCapacity>(&mut map);
    insert_setting::<PartitionBlockPolicySetting>(&mut map);
    insert_setting::<PartitionSeed>(&mut map);
    insert_setting::<VerifyCallDiscipline>(&mut map);
    insert_setting::<CheckGroupedInput>(&mut map);

    map
});

pub trait ExecutionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()>;
    fn get_as_string(conf: &ExecutionConfig) -> String;
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        other => Err(DbError::new(format!("Invalid boolean: {other}"))),
    }
}

fn parse_usize(value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| DbError::new(format!("Invalid unsigned integer: {value}")))
}

const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 512;

pub struct NumWorkers;

impl ExecutionSetting for NumWorkers {
    const NAME: &'static str = "num_workers";
    const DESCRIPTION: &'static str = "Number of worker threads used by parallel operators";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        let val = parse_usize(value)?;
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&val) {
            return Err(DbError::new(format!(
                "Worker count must be between {MIN_WORKERS} and {MAX_WORKERS}"
            )));
        }
        conf.num_workers = val;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        conf.num_workers.to_string()
    }
}

pub struct PartitionBlockCapacity;

impl ExecutionSetting for PartitionBlockCapacity {
    const NAME: &'static str = "partition_block_capacity";
    const DESCRIPTION: &'static str = "Rows per block for fixed size partition blocks";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        let val = parse_usize(value)?;
        if val == 0 {
            return Err(DbError::new("Block capacity must be greater than zero"));
        }
        conf.partition_block_capacity = val;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        conf.partition_block_capacity.to_string()
    }
}

pub struct PartitionBlockPolicySetting;

impl ExecutionSetting for PartitionBlockPolicySetting {
    const NAME: &'static str = "partition_block_policy";
    const DESCRIPTION: &'static str = "Block growth policy for partitioning, 'fixed' or 'growable'";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        let policy: PartitionBlockPolicy = value.parse()?;
        if let PartitionBlockPolicy::Fixed { capacity } = policy {
            if value.contains(':') {
                conf.partition_block_capacity = capacity;
            }
        }
        conf.partition_block_policy = policy;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        match conf.partition_block_policy {
            PartitionBlockPolicy::Fixed { .. } => "fixed".to_string(),
            PartitionBlockPolicy::Growable => "growable".to_string(),
        }
    }
}

pub struct PartitionSeed;

impl ExecutionSetting for PartitionSeed {
    const NAME: &'static str = "partition_seed";
    const DESCRIPTION: &'static str = "Default hash seed for partition operators";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        conf.partition_seed = value
            .parse()
            .map_err(|_| DbError::new(format!("Invalid seed: {value}")))?;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        conf.partition_seed.to_string()
    }
}

pub struct VerifyCallDiscipline;

impl ExecutionSetting for VerifyCallDiscipline {
    const NAME: &'static str = "verify_call_discipline";
    const DESCRIPTION: &'static str = "Wrap operators to check open/next/close ordering";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        conf.verify_call_discipline = parse_bool(value)?;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        conf.verify_call_discipline.to_string()
    }
}

pub struct CheckGroupedInput;

impl ExecutionSetting for CheckGroupedInput {
    const NAME: &'static str = "check_grouped_input";
    const DESCRIPTION: &'static str =
        "Error if input to a grouped reduce has a key reappear after it changed";

    fn set_from_str(value: &str, conf: &mut ExecutionConfig) -> Result<()> {
        conf.check_grouped_input = parse_bool(value)?;
        Ok(())
    }

    fn get_as_string(conf: &ExecutionConfig) -> String {
        conf.check_grouped_input.to_string()
    }
}
