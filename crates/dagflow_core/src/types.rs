use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use dagflow_error::{DbError, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Memory layout of a multi-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayLayout {
    /// C order.
    RowMajor,
    /// Fortran order.
    ColumnMajor,
}

impl ArrayLayout {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RowMajor => "C",
            Self::ColumnMajor => "F",
        }
    }
}

impl FromStr for ArrayLayout {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "C" => Ok(Self::RowMajor),
            "F" => Ok(Self::ColumnMajor),
            other => Err(DbError::plan(format!("Unknown array layout: {other}"))),
        }
    }
}

/// Kind tag of a type, as used in plan records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Atomic,
    Array,
    Tuple,
}

impl TypeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Array => "array",
            Self::Tuple => "tuple",
        }
    }
}

/// A structural type.
///
/// Types are only ever constructed through a `TypeTable`, so two types with
/// the same structure are always the same allocation.
#[derive(Debug, PartialEq, Eq)]
pub enum Type {
    Atomic {
        name: String,
    },
    Array {
        /// Element type, always a tuple.
        element: TypeRef,
        layout: ArrayLayout,
        num_dimensions: usize,
    },
    Tuple {
        fields: Vec<TypeRef>,
    },
}

impl Type {
    pub const fn kind(&self) -> TypeKind {
        match self {
            Self::Atomic { .. } => TypeKind::Atomic,
            Self::Array { .. } => TypeKind::Array,
            Self::Tuple { .. } => TypeKind::Tuple,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomic { name } => write!(f, "{name}"),
            Self::Array {
                element,
                layout,
                num_dimensions,
            } => write!(f, "Array<{element},{},{num_dimensions}>", layout.as_str()),
            Self::Tuple { fields } => {
                write!(f, "Tuple<")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ">")
            }
        }
    }
}

/// Handle to an interned type. Equality is identity.
#[derive(Debug, Clone)]
pub struct TypeRef(Arc<Type>);

impl TypeRef {
    pub fn kind(&self) -> TypeKind {
        self.0.kind()
    }

    /// Fields of a tuple type, None for other kinds.
    pub fn tuple_fields(&self) -> Option<&[TypeRef]> {
        match self.0.as_ref() {
            Type::Tuple { fields } => Some(fields),
            _ => None,
        }
    }
}

impl AsRef<Type> for TypeRef {
    fn as_ref(&self) -> &Type {
        &self.0
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Interning table for types, keyed on the structural description.
///
/// Shared by reference between everything that builds or reads plans.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Mutex<HashMap<String, TypeRef>>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, ty: Type) -> TypeRef {
        let desc = ty.to_string();
        let mut types = self.types.lock();
        types
            .entry(desc)
            .or_insert_with(|| TypeRef(Arc::new(ty)))
            .clone()
    }

    pub fn atomic(&self, name: &str) -> TypeRef {
        self.intern(Type::Atomic {
            name: name.to_string(),
        })
    }

    pub fn int64(&self) -> TypeRef {
        self.atomic("Int64")
    }

    pub fn utf8(&self) -> TypeRef {
        self.atomic("Utf8")
    }

    pub fn tuple(&self, fields: impl IntoIterator<Item = TypeRef>) -> TypeRef {
        self.intern(Type::Tuple {
            fields: fields.into_iter().collect(),
        })
    }

    /// Get an array type. The element type must be a tuple.
    pub fn array(
        &self,
        element: TypeRef,
        layout: ArrayLayout,
        num_dimensions: usize,
    ) -> Result<TypeRef> {
        if element.kind() != TypeKind::Tuple {
            return Err(DbError::plan("Array element type must be a tuple")
                .with_field("element", &element));
        }
        if num_dimensions == 0 {
            return Err(DbError::plan("Array must have at least one dimension"));
        }

        Ok(self.intern(Type::Array {
            element,
            layout,
            num_dimensions,
        }))
    }

    /// Look up an already interned type by its description.
    pub fn lookup(&self, desc: &str) -> Option<TypeRef> {
        self.types.lock().get(desc).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
