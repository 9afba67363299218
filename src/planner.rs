use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ShapeError;
use crate::shape::{FieldEntry, FieldShape};

/// Operator that filters elements of an array field by a nested filter.
pub(crate) const ELEM_MATCH: &str = "elemMatch";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SortArgs {
    /// Dotted field paths, most significant first.
    pub fields: Vec<String>,
    /// Order per field; missing entries sort ascending.
    #[serde(default)]
    pub order: Vec<SortOrder>,
}

/// A single field path, or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(path) => vec![path.as_str()],
            OneOrMany::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// Declarative query arguments, as found in a GraphQL connection field.
///
/// ```rust
/// use hauchiwa_query::QueryArgs;
/// use serde_json::json;
///
/// let args: QueryArgs = serde_json::from_value(json!({
///     "filter": { "title": { "eq": "B" } },
///     "sort": { "fields": ["date"], "order": ["DESC"] },
///     "group": "author.name",
/// }))
/// .unwrap();
///
/// let fields = args.query_fields().unwrap();
/// assert!(fields.contains("title"));
/// assert!(fields.contains("author"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryArgs {
    /// Field path → comparison operator → value.
    #[serde(default)]
    pub filter: Option<Map<String, Value>>,
    #[serde(default)]
    pub sort: Option<SortArgs>,
    #[serde(default)]
    pub group: Option<OneOrMany>,
    #[serde(default)]
    pub distinct: Option<OneOrMany>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub sum: Option<String>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QueryArgs {
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = match filter {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn sort(mut self, fields: &[&str], order: &[SortOrder]) -> Self {
        self.sort = Some(SortArgs {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            order: order.to_vec(),
        });
        self
    }

    /// Every field this query touches, merged into one shape.
    pub fn query_fields(&self) -> Result<FieldShape, ShapeError> {
        let mut shape = match &self.filter {
            Some(filter) => drop_query_operators(filter),
            None => FieldShape::default(),
        };

        let sort = self.sort.iter().flat_map(|sort| sort.fields.iter());
        let group = self.group.iter().flat_map(|group| group.to_vec());
        let distinct = self.distinct.iter().flat_map(|distinct| distinct.to_vec());
        let aggregates = [&self.max, &self.min, &self.sum].into_iter().flatten();

        let paths = sort
            .map(String::as_str)
            .chain(group)
            .chain(distinct)
            .chain(aggregates.map(String::as_str));

        for path in paths {
            shape.merge(&FieldShape::from_path(path))?;
        }

        Ok(shape)
    }
}

/// Strips comparison operators and their operands down to leaf markers.
/// `elemMatch` keeps its nested filter as a nested shape.
fn drop_query_operators(filter: &Map<String, Value>) -> FieldShape {
    let mut shape = FieldShape::default();

    for (key, value) in filter {
        let entry = match value {
            Value::Object(inner) => match inner.iter().next() {
                Some((op, Value::Object(operand))) if op == ELEM_MATCH => {
                    FieldEntry::Nested(drop_query_operators(operand))
                }
                Some((_, Value::Object(_))) => FieldEntry::Nested(drop_query_operators(inner)),
                _ => FieldEntry::Leaf,
            },
            _ => FieldEntry::Leaf,
        };

        shape.insert(key.clone(), entry);
    }

    shape
}
