use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::error::ShapeError;

/// One requested field: either a leaf, or a nested selection of sub-fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldEntry {
    Leaf,
    Nested(FieldShape),
}

impl FieldEntry {
    /// The nested selection, if this entry is not a leaf.
    pub fn nested(&self) -> Option<&FieldShape> {
        match self {
            FieldEntry::Leaf => None,
            FieldEntry::Nested(shape) => Some(shape),
        }
    }
}

/// A nested description of which fields (and sub-fields) a query touches.
///
/// `{ title: Leaf, author: { name: Leaf } }` is what a query filtering on
/// `title` and sorting on `author.name` needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldShape {
    fields: BTreeMap<String, FieldEntry>,
}

impl FieldShape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands a dotted path into nested levels: `a.b.c` becomes
    /// `{ a: { b: { c: Leaf } } }`. An empty path yields an empty shape.
    pub fn from_path(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }

        let mut segments = path.split('.').rev();
        let mut shape = FieldShape::default();

        if let Some(last) = segments.next() {
            shape.fields.insert(last.to_string(), FieldEntry::Leaf);
        }

        for segment in segments {
            let mut outer = FieldShape::default();
            outer
                .fields
                .insert(segment.to_string(), FieldEntry::Nested(shape));
            shape = outer;
        }

        shape
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FieldEntry> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: FieldEntry) {
        self.fields.insert(name.into(), entry);
    }

    pub fn with_leaf(mut self, name: impl Into<String>) -> Self {
        self.insert(name, FieldEntry::Leaf);
        self
    }

    pub fn with_nested(mut self, name: impl Into<String>, nested: FieldShape) -> Self {
        self.insert(name, FieldEntry::Nested(nested));
        self
    }

    /// Deep union of two shapes. A field that is a leaf on one side and a
    /// nested selection on the other is a contract violation.
    pub fn merge(&mut self, other: &FieldShape) -> Result<(), ShapeError> {
        self.merge_at(other, "")
    }

    fn merge_at(&mut self, other: &FieldShape, prefix: &str) -> Result<(), ShapeError> {
        for (name, entry) in &other.fields {
            match (self.fields.get_mut(name), entry) {
                (None, entry) => {
                    self.fields.insert(name.clone(), entry.clone());
                }
                (Some(FieldEntry::Leaf), FieldEntry::Leaf) => {}
                (Some(FieldEntry::Nested(ours)), FieldEntry::Nested(theirs)) => {
                    ours.merge_at(theirs, &join(prefix, name))?;
                }
                (Some(_), _) => return Err(ShapeError::Conflict(join(prefix, name))),
            }
        }

        Ok(())
    }

    /// Merges every shape in `shapes` into one.
    pub fn merged<'a>(
        shapes: impl IntoIterator<Item = &'a FieldShape>,
    ) -> Result<FieldShape, ShapeError> {
        shapes
            .into_iter()
            .try_fold(FieldShape::default(), |mut acc, shape| {
                acc.merge(shape)?;
                Ok(acc)
            })
    }

    /// Fields of `self` not already covered by `covered`.
    ///
    /// A leaf in `covered` covers the whole field, whatever `self` asks for
    /// beneath it. A nested selection in `covered` only covers the sub-fields
    /// it names.
    pub fn difference(&self, covered: &FieldShape) -> FieldShape {
        let mut result = FieldShape::default();

        for (name, entry) in &self.fields {
            match (covered.fields.get(name), entry) {
                (None, entry) => {
                    result.fields.insert(name.clone(), entry.clone());
                }
                (Some(FieldEntry::Leaf), _) => {}
                (Some(FieldEntry::Nested(_)), FieldEntry::Leaf) => {}
                (Some(FieldEntry::Nested(theirs)), FieldEntry::Nested(ours)) => {
                    let inner = ours.difference(theirs);
                    if !inner.is_empty() {
                        result.fields.insert(name.clone(), FieldEntry::Nested(inner));
                    }
                }
            }
        }

        result
    }
}

impl<'a> IntoIterator for &'a FieldShape {
    type Item = (&'a String, &'a FieldEntry);
    type IntoIter = btree_map::Iter<'a, String, FieldEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
