//! Splitting tuples into keys and the remaining fields.

use ahash::RandomState;
use dagflow_error::{DbError, Result};
use hashbrown::{HashMap, HashSet};

use crate::value::Value;

/// Fixed state so that map iteration order is reproducible across runs.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

pub type KeyMap<V> = HashMap<Value, V, RandomState>;
pub type KeySet = HashSet<Value, RandomState>;

pub fn new_key_map<V>() -> KeyMap<V> {
    HashMap::with_hasher(HASH_RANDOM_STATE)
}

pub fn new_key_set() -> KeySet {
    HashSet::with_hasher(HASH_RANDOM_STATE)
}

fn check_width(fields: &[Value], num_keys: usize) -> Result<()> {
    if fields.len() < num_keys {
        return Err(DbError::protocol("Tuple has fewer fields than keys")
            .with_field("num_fields", fields.len())
            .with_field("num_keys", num_keys));
    }
    Ok(())
}

/// Key of a tuple, made of its leading `num_keys` fields.
pub fn key_of(row: &Value, num_keys: usize) -> Result<Value> {
    let fields = row.try_as_tuple()?;
    check_width(fields, num_keys)?;
    Ok(Value::Tuple(fields[..num_keys].to_vec()))
}

/// Split a tuple into its key and the remaining fields.
pub fn split_key(row: Value, num_keys: usize) -> Result<(Value, Vec<Value>)> {
    let mut fields = row.try_into_tuple()?;
    check_width(&fields, num_keys)?;
    let rest = fields.split_off(num_keys);
    Ok((Value::Tuple(fields), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_leading_fields() {
        let row = Value::tuple([Value::int64(1), Value::utf8("a"), Value::int64(3)]);
        assert_eq!(Value::tuple([Value::int64(1)]), key_of(&row, 1).unwrap());

        let (key, rest) = split_key(row, 2).unwrap();
        assert_eq!(Value::tuple([Value::int64(1), Value::utf8("a")]), key);
        assert_eq!(vec![Value::int64(3)], rest);
    }

    #[test]
    fn too_few_fields() {
        let row = Value::tuple([Value::int64(1)]);
        key_of(&row, 2).unwrap_err();
        split_key(Value::int64(1), 1).unwrap_err();
    }
}
