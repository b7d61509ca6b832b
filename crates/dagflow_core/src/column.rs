use std::collections::BTreeSet;
use std::fmt;

use dagflow_error::{DbError, Result};

use crate::types::{TypeRef, TypeTable};

/// Logical identity of a column, independent of its position in a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a field in a `ColumnArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldProperty {
    Grouped,
    Sorted,
    Unique,
}

impl FieldProperty {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grouped => "grouped",
            Self::Sorted => "sorted",
            Self::Unique => "unique",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "grouped" => Ok(Self::Grouped),
            "sorted" => Ok(Self::Sorted),
            "unique" => Ok(Self::Unique),
            other => Err(DbError::plan(format!("Unknown field property: {other}"))),
        }
    }

    pub const ALL: [FieldProperty; 3] = [Self::Grouped, Self::Sorted, Self::Unique];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldProperties {
    pub grouped: bool,
    pub sorted: bool,
    pub unique: bool,
}

impl FieldProperties {
    pub fn get(&self, prop: FieldProperty) -> bool {
        match prop {
            FieldProperty::Grouped => self.grouped,
            FieldProperty::Sorted => self.sorted,
            FieldProperty::Unique => self.unique,
        }
    }

    pub fn set(&mut self, prop: FieldProperty, value: bool) {
        match prop {
            FieldProperty::Grouped => self.grouped = value,
            FieldProperty::Sorted => self.sorted = value,
            FieldProperty::Unique => self.unique = value,
        }
    }
}

/// Ordered list of fields making up a tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleSchema {
    pub fields: Vec<FieldId>,
}

impl TupleSchema {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Atomic(TypeRef),
    Array {
        /// The array type itself.
        ty: TypeRef,
        /// Structure of a single element.
        element: TupleSchema,
    },
}

impl FieldType {
    pub fn type_ref(&self) -> &TypeRef {
        match self {
            Self::Atomic(ty) => ty,
            Self::Array { ty, .. } => ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub position: usize,
    pub field_type: FieldType,
    pub attribute: AttributeId,
    pub properties: FieldProperties,
}

/// Owns every field and attribute of a plan.
///
/// Fields refer to their attribute by id, and each attribute keeps the set of
/// fields bound to it. Both directions are only ever updated together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnArena {
    fields: Vec<Field>,
    attributes: Vec<BTreeSet<FieldId>>,
}

impl ColumnArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_attribute(&mut self) -> AttributeId {
        let id = AttributeId(self.attributes.len() as u32);
        self.attributes.push(BTreeSet::new());
        id
    }

    /// Make sure an attribute with the given id exists, creating any missing
    /// attributes up to it.
    ///
    /// Used when rebuilding an arena from a plan record.
    pub fn ensure_attribute(&mut self, id: AttributeId) -> AttributeId {
        while self.attributes.len() <= id.0 as usize {
            self.attributes.push(BTreeSet::new());
        }
        id
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    pub fn new_field(
        &mut self,
        position: usize,
        field_type: FieldType,
        attribute: AttributeId,
    ) -> Result<FieldId> {
        let id = FieldId(self.fields.len() as u32);
        let members = self.members_mut(attribute)?;
        members.insert(id);
        self.fields.push(Field {
            position,
            field_type,
            attribute,
            properties: FieldProperties::default(),
        });
        Ok(id)
    }

    /// Create a tuple of atomic fields, each bound to a fresh attribute.
    pub fn new_atomic_tuple(
        &mut self,
        types: impl IntoIterator<Item = TypeRef>,
    ) -> Result<TupleSchema> {
        let mut fields = Vec::new();
        for (position, ty) in types.into_iter().enumerate() {
            let attr = self.new_attribute();
            fields.push(self.new_field(position, FieldType::Atomic(ty), attr)?);
        }
        Ok(TupleSchema { fields })
    }

    pub fn field(&self, id: FieldId) -> Result<&Field> {
        self.fields
            .get(id.0 as usize)
            .ok_or_else(|| DbError::new("Unknown field").with_field("field", id.0))
    }

    fn field_mut(&mut self, id: FieldId) -> Result<&mut Field> {
        self.fields
            .get_mut(id.0 as usize)
            .ok_or_else(|| DbError::new("Unknown field").with_field("field", id.0))
    }

    fn members_mut(&mut self, attr: AttributeId) -> Result<&mut BTreeSet<FieldId>> {
        self.attributes
            .get_mut(attr.0 as usize)
            .ok_or_else(|| DbError::new("Unknown attribute").with_field("attribute", attr))
    }

    pub fn attribute_of(&self, field: FieldId) -> Result<AttributeId> {
        Ok(self.field(field)?.attribute)
    }

    /// Fields currently bound to an attribute.
    pub fn members(&self, attr: AttributeId) -> Result<impl Iterator<Item = FieldId> + '_> {
        let members = self
            .attributes
            .get(attr.0 as usize)
            .ok_or_else(|| DbError::new("Unknown attribute").with_field("attribute", attr))?;
        Ok(members.iter().copied())
    }

    /// Rebind a field to a different attribute.
    pub fn bind(&mut self, field: FieldId, attr: AttributeId) -> Result<()> {
        // Validate both handles before touching anything.
        self.members_mut(attr)?;
        let old = self.field(field)?.attribute;

        self.members_mut(old)?.remove(&field);
        self.members_mut(attr)?.insert(field);
        self.field_mut(field)?.attribute = attr;
        Ok(())
    }

    /// Move every field bound to `from` over to `to`.
    ///
    /// Used when two columns are known to hold the same values, e.g. join
    /// keys after a join.
    pub fn move_fields(&mut self, from: AttributeId, to: AttributeId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.members_mut(to)?;
        let moved = std::mem::take(self.members_mut(from)?);
        for field in &moved {
            self.field_mut(*field)?.attribute = to;
        }
        self.members_mut(to)?.extend(moved);
        Ok(())
    }

    pub fn set_property(&mut self, field: FieldId, prop: FieldProperty, value: bool) -> Result<()> {
        self.field_mut(field)?.properties.set(prop, value);
        Ok(())
    }

    pub fn has_property(&self, field: FieldId, prop: FieldProperty) -> Result<bool> {
        Ok(self.field(field)?.properties.get(prop))
    }

    /// Attributes of each field in a tuple, in position order.
    pub fn attributes_of(&self, schema: &TupleSchema) -> Result<Vec<AttributeId>> {
        schema.fields.iter().map(|f| self.attribute_of(*f)).collect()
    }

    /// Compute the tuple type described by a schema.
    pub fn tuple_type(&self, schema: &TupleSchema, types: &TypeTable) -> Result<TypeRef> {
        let fields = schema
            .fields
            .iter()
            .map(|f| Ok(self.field(*f)?.field_type.type_ref().clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(types.tuple(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_consistent(arena: &ColumnArena) {
        for (idx, field) in arena.fields.iter().enumerate() {
            let id = FieldId(idx as u32);
            assert!(arena.attributes[field.attribute.0 as usize].contains(&id));
        }
        for (idx, members) in arena.attributes.iter().enumerate() {
            for m in members {
                assert_eq!(idx as u32, arena.fields[m.0 as usize].attribute.0);
            }
        }
    }

    #[test]
    fn bind_moves_membership() {
        let types = TypeTable::new();
        let mut arena = ColumnArena::new();
        let a = arena.new_attribute();
        let b = arena.new_attribute();
        let f = arena.new_field(0, FieldType::Atomic(types.int64()), a).unwrap();

        arena.bind(f, b).unwrap();
        assert_eq!(b, arena.attribute_of(f).unwrap());
        assert_eq!(0, arena.members(a).unwrap().count());
        assert_eq!(vec![f], arena.members(b).unwrap().collect::<Vec<_>>());
        check_consistent(&arena);
    }

    #[test]
    fn move_fields_transfers_all() {
        let types = TypeTable::new();
        let mut arena = ColumnArena::new();
        let left = arena.new_atomic_tuple([types.int64(), types.utf8()]).unwrap();
        let right = arena.new_atomic_tuple([types.int64()]).unwrap();

        let left_key = arena.attribute_of(left.fields[0]).unwrap();
        let right_key = arena.attribute_of(right.fields[0]).unwrap();
        arena.move_fields(right_key, left_key).unwrap();

        assert_eq!(2, arena.members(left_key).unwrap().count());
        assert_eq!(0, arena.members(right_key).unwrap().count());
        check_consistent(&arena);
    }

    #[test]
    fn bind_unknown_attribute_leaves_arena_untouched() {
        let types = TypeTable::new();
        let mut arena = ColumnArena::new();
        let schema = arena.new_atomic_tuple([types.int64()]).unwrap();
        let before = arena.clone();

        arena.bind(schema.fields[0], AttributeId(42)).unwrap_err();
        assert_eq!(before, arena);
    }

    #[test]
    fn properties() {
        let types = TypeTable::new();
        let mut arena = ColumnArena::new();
        let schema = arena.new_atomic_tuple([types.int64()]).unwrap();
        let f = schema.fields[0];

        arena.set_property(f, FieldProperty::Sorted, true).unwrap();
        assert!(arena.has_property(f, FieldProperty::Sorted).unwrap());
        assert!(!arena.has_property(f, FieldProperty::Unique).unwrap());
    }

    #[test]
    fn tuple_type_of_schema() {
        let types = TypeTable::new();
        let mut arena = ColumnArena::new();
        let schema = arena.new_atomic_tuple([types.int64(), types.utf8()]).unwrap();
        assert_eq!(
            "Tuple<Int64,Utf8>",
            arena.tuple_type(&schema, &types).unwrap().to_string()
        );
    }
}
