use std::ops::{Index, IndexMut, Range};
use std::sync::Arc;

use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// One named, time-indexed field of a [`Structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    len: usize,
    dim: usize,
    offset: usize,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of time points.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Dimension of the entry stored at each time point.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn size(&self) -> usize {
        self.len * self.dim
    }
}

/// Shape of a structured array: an ordered set of fields `name -> len x dim`.
///
/// Values are laid out flat in field declaration order, time point after time
/// point, so the entry of field `name` at time `t` is a contiguous slice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Structure {
    fields: Vec<Field>,
    size: usize,
}

impl Structure {
    /// Builds a shared structure from `(name, len, dim)` triples.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or duplicate names and for fields with a zero
    /// length or dimension.
    pub fn new<I, S>(fields: I) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = (S, usize, usize)>,
        S: Into<String>,
    {
        let mut structure = Structure::default();
        for (name, len, dim) in fields {
            let name = name.into();
            if name.is_empty() {
                return Err(Error::EmptyFieldName);
            }
            if structure.fields.iter().any(|f| f.name == name) {
                return Err(Error::DuplicateField { name });
            }
            if len == 0 || dim == 0 {
                return Err(Error::EmptyField { name, len, dim });
            }
            structure.fields.push(Field {
                name,
                len,
                dim,
                offset: structure.size,
            });
            structure.size += len * dim;
        }
        Ok(Arc::new(structure))
    }

    /// A structure with no fields, used when a problem has no parameters.
    pub fn empty() -> Arc<Self> {
        Arc::new(Structure::default())
    }

    /// Total number of scalar entries.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownField { name: name.into() })
    }

    /// Flat range holding the whole trajectory of `name`.
    pub(crate) fn field_range(&self, name: &str) -> Result<Range<usize>> {
        let field = self.field(name)?;
        Ok(field.offset..field.offset + field.size())
    }

    /// Flat range holding the entry of `name` at time `t`.
    pub(crate) fn entry_range(&self, name: &str, t: usize) -> Result<Range<usize>> {
        let field = self.field(name)?;
        if t >= field.len {
            return Err(Error::TimeIndexOutOfRange {
                name: name.into(),
                t,
                len: field.len,
            });
        }
        let start = field.offset + t * field.dim;
        Ok(start..start + field.dim)
    }
}

/// Borrowed, read-only view of structured values.
///
/// This is what objective and constraint closures receive.
#[derive(Debug, Clone, Copy)]
pub struct StructView<'a> {
    structure: &'a Structure,
    data: &'a [f64],
}

impl<'a> StructView<'a> {
    pub(crate) fn new(structure: &'a Structure, data: &'a [f64]) -> Self {
        debug_assert_eq!(structure.size(), data.len());
        Self { structure, data }
    }

    pub fn structure(&self) -> &'a Structure {
        self.structure
    }

    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }

    /// Entry of `name` at time `t`.
    pub fn try_get(&self, name: &str, t: usize) -> Result<&'a [f64]> {
        let range = self.structure.entry_range(name, t)?;
        Ok(&self.data[range])
    }

    /// Entry of `name` at time `t`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is unknown or `t` is out of range.
    pub fn get(&self, name: &str, t: usize) -> &'a [f64] {
        match self.try_get(name, t) {
            Ok(entry) => entry,
            Err(e) => panic!("{e}"),
        }
    }

    /// Trajectory of `name` as a `dim x len` matrix (one column per time point).
    pub fn trajectory(&self, name: &str) -> Result<DMatrix<f64>> {
        let field = self.structure.field(name)?;
        let range = self.structure.field_range(name)?;
        Ok(DMatrix::from_column_slice(
            field.dim,
            field.len,
            &self.data[range],
        ))
    }

    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.structure.field(name)?.len)
    }

    pub fn dim(&self, name: &str) -> Result<usize> {
        Ok(self.structure.field(name)?.dim)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Index<(&str, usize)> for StructView<'_> {
    type Output = [f64];

    fn index(&self, (name, t): (&str, usize)) -> &[f64] {
        self.get(name, t)
    }
}

/// Owned structured values with a fixed shape.
///
/// Used for variables, bounds, guesses and parameters alike. Only the values
/// can change; the structure is shared and immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct StructArray {
    structure: Arc<Structure>,
    data: Vec<f64>,
}

impl StructArray {
    pub fn zeros(structure: &Arc<Structure>) -> Self {
        Self::filled(structure, 0.0)
    }

    pub fn filled(structure: &Arc<Structure>, value: f64) -> Self {
        Self {
            structure: Arc::clone(structure),
            data: vec![value; structure.size()],
        }
    }

    /// Wraps flat values laid out as described by [`Structure`].
    pub fn from_vec(structure: &Arc<Structure>, data: Vec<f64>) -> Result<Self> {
        if data.len() != structure.size() {
            return Err(Error::DimensionMismatch {
                what: "structured array".into(),
                expected: structure.size(),
                actual: data.len(),
            });
        }
        Ok(Self {
            structure: Arc::clone(structure),
            data,
        })
    }

    pub fn structure(&self) -> &Arc<Structure> {
        &self.structure
    }

    /// True when both arrays have the same fields, lengths and dimensions.
    pub fn same_shape(&self, other: &StructArray) -> bool {
        Arc::ptr_eq(&self.structure, &other.structure) || self.structure == other.structure
    }

    pub fn view(&self) -> StructView<'_> {
        StructView::new(&self.structure, &self.data)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub(crate) fn copy_from_slice(&mut self, values: &[f64]) {
        self.data.copy_from_slice(values);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.structure.keys()
    }

    pub fn len(&self, name: &str) -> Result<usize> {
        self.view().len(name)
    }

    pub fn dim(&self, name: &str) -> Result<usize> {
        self.view().dim(name)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn try_get(&self, name: &str, t: usize) -> Result<&[f64]> {
        let range = self.structure.entry_range(name, t)?;
        Ok(&self.data[range])
    }

    /// # Panics
    ///
    /// Panics if `name` is unknown or `t` is out of range.
    pub fn get(&self, name: &str, t: usize) -> &[f64] {
        match self.try_get(name, t) {
            Ok(entry) => entry,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_get_mut(&mut self, name: &str, t: usize) -> Result<&mut [f64]> {
        let range = self.structure.entry_range(name, t)?;
        Ok(&mut self.data[range])
    }

    pub fn trajectory(&self, name: &str) -> Result<DMatrix<f64>> {
        self.view().trajectory(name)
    }

    /// Overwrites the entry of `name` at time `t`.
    pub fn set(&mut self, name: &str, t: usize, values: &[f64]) -> Result<()> {
        let entry = self.try_get_mut(name, t)?;
        if entry.len() != values.len() {
            return Err(Error::DimensionMismatch {
                what: format!("entry `{name}`"),
                expected: entry.len(),
                actual: values.len(),
            });
        }
        entry.copy_from_slice(values);
        Ok(())
    }

    /// Overwrites selected components of the entry of `name` at time `t`.
    ///
    /// `values[k]` is written to component `indices[k]`.
    pub fn set_indices(
        &mut self,
        name: &str,
        t: usize,
        indices: &[usize],
        values: &[f64],
    ) -> Result<()> {
        if indices.len() != values.len() {
            return Err(Error::DimensionMismatch {
                what: format!("indexed entry `{name}`"),
                expected: indices.len(),
                actual: values.len(),
            });
        }
        let entry = self.try_get_mut(name, t)?;
        let dim = entry.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= dim) {
            return Err(Error::ComponentOutOfRange {
                name: name.into(),
                index,
                dim,
            });
        }
        for (&i, &v) in indices.iter().zip(values) {
            entry[i] = v;
        }
        Ok(())
    }

    /// Sets every time point of `name` to the same entry.
    pub fn tile(&mut self, name: &str, values: &[f64]) -> Result<()> {
        let len = self.len(name)?;
        for t in 0..len {
            self.set(name, t, values)?;
        }
        Ok(())
    }

    /// Sets every component of every time point of `name` to `value`.
    pub fn fill_field(&mut self, name: &str, value: f64) -> Result<()> {
        let range = self.structure.field_range(name)?;
        self.data[range].fill(value);
        Ok(())
    }

    /// Overwrites the whole trajectory of `name` from a `dim x len` matrix.
    pub fn set_trajectory(&mut self, name: &str, values: &DMatrix<f64>) -> Result<()> {
        let field = self.structure.field(name)?;
        if values.nrows() != field.dim || values.ncols() != field.len {
            return Err(Error::DimensionMismatch {
                what: format!("trajectory `{name}`"),
                expected: field.size(),
                actual: values.len(),
            });
        }
        let range = self.structure.field_range(name)?;
        self.data[range].copy_from_slice(values.as_slice());
        Ok(())
    }
}

impl Index<(&str, usize)> for StructArray {
    type Output = [f64];

    fn index(&self, (name, t): (&str, usize)) -> &[f64] {
        self.get(name, t)
    }
}

impl IndexMut<(&str, usize)> for StructArray {
    fn index_mut(&mut self, (name, t): (&str, usize)) -> &mut [f64] {
        match self.try_get_mut(name, t) {
            Ok(entry) => entry,
            Err(e) => panic!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xu(n: usize) -> Arc<Structure> {
        Structure::new([("x", n + 1, 2), ("u", n, 1)]).unwrap()
    }

    #[test]
    fn layout_is_field_then_time_major() {
        let s = xu(3);
        assert_eq!(s.size(), 4 * 2 + 3);

        let data: Vec<f64> = (0..s.size()).map(|i| i as f64).collect();
        let a = StructArray::from_vec(&s, data).unwrap();
        assert_eq!(a.get("x", 0), &[0.0, 1.0]);
        assert_eq!(a.get("x", 3), &[6.0, 7.0]);
        assert_eq!(a[("u", 0)], [8.0]);
        assert_eq!(a[("u", 2)], [10.0]);
    }

    #[test]
    fn rejects_bad_fields() {
        assert_eq!(
            Structure::new([("x", 2, 1), ("x", 3, 1)]).unwrap_err(),
            Error::DuplicateField { name: "x".into() }
        );
        assert!(matches!(
            Structure::new([("x", 0, 1)]),
            Err(Error::EmptyField { .. })
        ));
        assert_eq!(
            Structure::new([("", 1, 1)]).unwrap_err(),
            Error::EmptyFieldName
        );
    }

    #[test]
    fn addressing_errors() {
        let a = StructArray::zeros(&xu(2));
        assert!(matches!(
            a.try_get("y", 0),
            Err(Error::UnknownField { .. })
        ));
        assert!(matches!(
            a.try_get("u", 2),
            Err(Error::TimeIndexOutOfRange { t: 2, len: 2, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "unknown field `z`")]
    fn indexing_unknown_field_panics() {
        let a = StructArray::zeros(&xu(2));
        let _ = &a[("z", 0)];
    }

    #[test]
    fn set_and_set_indices() {
        let mut a = StructArray::zeros(&xu(2));
        a.set("x", 1, &[1.0, 2.0]).unwrap();
        a.set_indices("x", 2, &[1], &[5.0]).unwrap();
        assert_eq!(a.get("x", 1), &[1.0, 2.0]);
        assert_eq!(a.get("x", 2), &[0.0, 5.0]);

        assert!(matches!(
            a.set("x", 0, &[1.0]),
            Err(Error::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            a.set_indices("x", 0, &[2], &[1.0]),
            Err(Error::ComponentOutOfRange { index: 2, dim: 2, .. })
        ));
    }

    #[test]
    fn trajectories_round_through_matrices() {
        let mut a = StructArray::zeros(&xu(2));
        a.tile("x", &[1.0, -1.0]).unwrap();
        let traj = a.trajectory("x").unwrap();
        assert_eq!(traj.shape(), (2, 3));
        assert_eq!(traj[(1, 2)], -1.0);

        let mut other = StructArray::filled(a.structure(), 9.0);
        other.set_trajectory("x", &traj).unwrap();
        assert_eq!(other.get("x", 2), &[1.0, -1.0]);
        assert_eq!(other.get("u", 0), &[9.0]);
        assert!(other.set_trajectory("u", &traj).is_err());
    }

    #[test]
    fn shape_survives_mutation() {
        let s = xu(4);
        let mut a = StructArray::zeros(&s);
        let b = StructArray::zeros(&xu(4));
        assert!(a.same_shape(&b));

        a.fill_field("u", 3.0).unwrap();
        a[("x", 4)].copy_from_slice(&[1.0, 1.0]);
        assert!(a.same_shape(&b));
        assert_eq!(a.as_slice().len(), s.size());
        assert!(!a.same_shape(&StructArray::zeros(&xu(3))));
    }
}
