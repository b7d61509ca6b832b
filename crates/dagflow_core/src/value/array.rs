use std::fmt;
use std::hash::{Hash, Hasher};

use dagflow_error::{DbError, Result};

use super::Value;
use super::shared_buffer::SharedBuffer;

/// An array value: a view over a shared buffer of elements.
///
/// `outer_shape` describes the allocation as it was created, `view_shape` the
/// part visible through this handle. Elements are stored row-major, and
/// views only ever narrow the leading dimension, so the visible elements are
/// always a contiguous run starting at `offset`.
#[derive(Clone)]
pub struct ArrayValue {
    buffer: SharedBuffer<Value>,
    outer_shape: Vec<usize>,
    view_shape: Vec<usize>,
    offset: usize,
}

impl ArrayValue {
    /// Create a one dimensional array.
    pub fn from_values(values: Vec<Value>) -> Self {
        let shape = vec![values.len()];
        ArrayValue {
            buffer: SharedBuffer::from_vec(values),
            outer_shape: shape.clone(),
            view_shape: shape,
            offset: 0,
        }
    }

    /// Create an array with an explicit (row-major) shape.
    pub fn try_with_shape(values: Vec<Value>, shape: Vec<usize>) -> Result<Self> {
        if shape.is_empty() {
            return Err(DbError::new("Array shape must have at least one dimension"));
        }
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(DbError::new("Array shape does not match number of values")
                .with_field("expected", expected)
                .with_field("got", values.len()));
        }

        Ok(ArrayValue {
            buffer: SharedBuffer::from_vec(values),
            outer_shape: shape.clone(),
            view_shape: shape,
            offset: 0,
        })
    }

    pub fn empty() -> Self {
        Self::from_values(Vec::new())
    }

    /// Length of the leading dimension of this view.
    pub fn len(&self) -> usize {
        self.view_shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_dimensions(&self) -> usize {
        self.view_shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.view_shape
    }

    pub fn outer_shape(&self) -> &[usize] {
        &self.outer_shape
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of elements one step along the leading dimension covers.
    fn stride(&self) -> usize {
        self.view_shape[1..].iter().product()
    }

    /// All elements visible through this view, row-major.
    pub fn values(&self) -> &[Value] {
        let count = self.len() * self.stride();
        &self.buffer.as_slice()[self.offset..self.offset + count]
    }

    /// Get an element of a one dimensional view.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        if idx >= self.len() || self.num_dimensions() != 1 {
            return None;
        }
        self.values().get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values().iter()
    }

    /// Create a new view over `len` entries of the leading dimension, starting
    /// at `start`.
    ///
    /// No data is copied. The new view shares the control block with this
    /// one.
    pub fn slice(&self, start: usize, len: usize) -> Result<Self> {
        if start.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(DbError::protocol("Array slice out of bounds")
                .with_field("start", start)
                .with_field("len", len)
                .with_field("array_len", self.len()));
        }

        let mut view_shape = self.view_shape.clone();
        view_shape[0] = len;

        Ok(ArrayValue {
            buffer: self.buffer.clone(),
            outer_shape: self.outer_shape.clone(),
            view_shape,
            offset: self.offset + start * self.stride(),
        })
    }

    /// Check if this view and `other` share the same underlying buffer.
    pub fn shares_buffer(&self, other: &ArrayValue) -> bool {
        self.buffer.ptr_eq(&other.buffer)
    }

    /// Number of live handles to the underlying buffer.
    pub fn buffer_ref_count(&self) -> usize {
        self.buffer.ref_count()
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.view_shape == other.view_shape && self.values() == other.values()
    }
}

impl Eq for ArrayValue {}

impl Hash for ArrayValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.view_shape.hash(state);
        self.values().hash(state);
    }
}

impl fmt::Debug for ArrayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayValue")
            .field("view_shape", &self.view_shape)
            .field("outer_shape", &self.outer_shape)
            .field("offset", &self.offset)
            .field("values", &self.values())
            .finish()
    }
}

/// Builder for arrays that grow one element at a time.
///
/// Capacity starts at one and doubles whenever it's exhausted.
#[derive(Debug)]
pub struct GrowableArray {
    values: Vec<Value>,
    capacity: usize,
}

impl Default for GrowableArray {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowableArray {
    pub fn new() -> Self {
        GrowableArray {
            values: Vec::with_capacity(1),
            capacity: 1,
        }
    }

    pub fn push(&mut self, value: Value) {
        if self.values.len() == self.capacity {
            self.values.reserve_exact(self.capacity);
            self.capacity *= 2;
        }
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Logical capacity under the doubling policy.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_array(self) -> ArrayValue {
        ArrayValue::from_values(self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(vals: impl IntoIterator<Item = i64>) -> Vec<Value> {
        vals.into_iter().map(Value::int64).collect()
    }

    #[test]
    fn slice_shares_buffer() {
        let arr = ArrayValue::from_values(ints(0..10));
        let s = arr.slice(2, 3).unwrap();

        assert!(arr.shares_buffer(&s));
        assert_eq!(2, arr.buffer_ref_count());
        assert_eq!(&ints(2..5), s.values());
        assert_eq!(2, s.offset());
        assert_eq!(&[10], s.outer_shape());
        assert_eq!(&[3], s.shape());
    }

    #[test]
    fn slice_of_slice() {
        let arr = ArrayValue::from_values(ints(0..10));
        let s = arr.slice(2, 6).unwrap().slice(1, 2).unwrap();
        assert_eq!(&ints(3..5), s.values());
        assert_eq!(3, s.offset());
    }

    #[test]
    fn slice_out_of_bounds() {
        let arr = ArrayValue::from_values(ints(0..4));
        arr.slice(3, 2).unwrap_err();
        arr.slice(1, usize::MAX).unwrap_err();
        arr.slice(usize::MAX, 1).unwrap_err();
    }

    #[test]
    fn slice_two_dimensional() {
        let arr = ArrayValue::try_with_shape(ints(0..6), vec![3, 2]).unwrap();
        let s = arr.slice(1, 2).unwrap();
        assert_eq!(&[2, 2], s.shape());
        assert_eq!(&ints(2..6), s.values());
        assert_eq!(None, s.get(0));
    }

    #[test]
    fn buffer_freed_after_last_view() {
        let arr = ArrayValue::from_values(ints(0..4));
        let views: Vec<_> = (0..4).map(|i| arr.slice(i, 1).unwrap()).collect();
        assert_eq!(5, arr.buffer_ref_count());
        drop(arr);
        assert_eq!(4, views[0].buffer_ref_count());
    }

    #[test]
    fn equality_ignores_offset() {
        let a = ArrayValue::from_values(ints([1, 2, 3, 1, 2]));
        let b = ArrayValue::from_values(ints([1, 2]));
        assert_eq!(a.slice(3, 2).unwrap(), b);
    }

    #[test]
    fn growable_doubles() {
        let mut g = GrowableArray::new();
        assert_eq!(1, g.capacity());
        let mut caps = Vec::new();
        for i in 0..9 {
            g.push(Value::int64(i));
            caps.push(g.capacity());
        }
        assert_eq!(vec![1, 2, 4, 4, 8, 8, 8, 8, 16], caps);
        assert_eq!(9, g.into_array().len());
    }
}
