//! Resolution of embedded expression bodies.
//!
//! Operators such as `Map` carry an expression body as a string. When a plan
//! is executed in process, the body is used as a key into a registry of
//! native functions.

use std::fmt;
use std::sync::Arc;

use dagflow_error::{DbError, Result};
use hashbrown::HashMap;

use crate::value::Value;

/// Transforms one tuple into another.
pub type MapFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
/// Decides if a tuple passes a filter.
pub type PredicateFn = Arc<dyn Fn(&Value) -> Result<bool> + Send + Sync>;
/// Merges a value into an accumulator. Must be associative and commutative.
pub type ReduceFn = Arc<dyn Fn(Value, &Value) -> Result<Value> + Send + Sync>;
/// Evaluated against a left tuple and a right tuple with the same key.
pub type AntiJoinPredicateFn = Arc<dyn Fn(&Value, &Value) -> Result<bool> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    maps: HashMap<String, MapFn>,
    predicates: HashMap<String, PredicateFn>,
    reducers: HashMap<String, ReduceFn>,
    anti_join_predicates: HashMap<String, AntiJoinPredicateFn>,
}

fn unknown_function(kind: &'static str, body: &str) -> DbError {
    DbError::plan("Unknown expression body")
        .with_field("function_kind", kind)
        .with_field("body", body)
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_map<F>(&mut self, body: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.maps.insert(body.into(), Arc::new(f));
        self
    }

    pub fn register_predicate<F>(&mut self, body: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<bool> + Send + Sync + 'static,
    {
        self.predicates.insert(body.into(), Arc::new(f));
        self
    }

    pub fn register_reducer<F>(&mut self, body: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.reducers.insert(body.into(), Arc::new(f));
        self
    }

    pub fn register_anti_join_predicate<F>(&mut self, body: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Result<bool> + Send + Sync + 'static,
    {
        self.anti_join_predicates.insert(body.into(), Arc::new(f));
        self
    }

    pub fn get_map(&self, body: &str) -> Result<MapFn> {
        self.maps
            .get(body)
            .cloned()
            .ok_or_else(|| unknown_function("map", body))
    }

    pub fn get_predicate(&self, body: &str) -> Result<PredicateFn> {
        self.predicates
            .get(body)
            .cloned()
            .ok_or_else(|| unknown_function("predicate", body))
    }

    pub fn get_reducer(&self, body: &str) -> Result<ReduceFn> {
        self.reducers
            .get(body)
            .cloned()
            .ok_or_else(|| unknown_function("reducer", body))
    }

    pub fn get_anti_join_predicate(&self, body: &str) -> Result<AntiJoinPredicateFn> {
        self.anti_join_predicates
            .get(body)
            .cloned()
            .ok_or_else(|| unknown_function("anti_join_predicate", body))
    }
}

fn sorted_names<V>(funcs: &HashMap<String, V>) -> Vec<&str> {
    let mut names: Vec<_> = funcs.keys().map(|k| k.as_str()).collect();
    names.sort_unstable();
    names
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("maps", &sorted_names(&self.maps))
            .field("predicates", &sorted_names(&self.predicates))
            .field("reducers", &sorted_names(&self.reducers))
            .field(
                "anti_join_predicates",
                &sorted_names(&self.anti_join_predicates),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use dagflow_error::ErrorKind;

    use super::*;

    #[test]
    fn lookup_registered() {
        let mut reg = FunctionRegistry::new();
        reg.register_map("double", |v| Ok(Value::int64(v.field(0)?.try_as_i64()? * 2)))
            .register_predicate("even", |v| Ok(v.field(0)?.try_as_i64()? % 2 == 0));

        let double = reg.get_map("double").unwrap();
        let out = double(&Value::tuple([Value::int64(4)])).unwrap();
        assert_eq!(Value::int64(8), out);

        let even = reg.get_predicate("even").unwrap();
        assert!(even(&Value::tuple([Value::int64(4)])).unwrap());
    }

    #[test]
    fn unknown_body_is_plan_error() {
        let reg = FunctionRegistry::new();
        let err = reg.get_reducer("sum").err().unwrap();
        assert_eq!(ErrorKind::PlanMalformed, err.kind());
        assert_eq!(Some("sum"), err.get_field("body"));
    }
}
