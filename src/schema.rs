use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::NodeModel;
use crate::node::INTERNAL;

/// Custom field resolver function pointer. This function is provided by the
/// user from the userland, and invoked by the node model whenever a query
/// needs the field's value.
pub type FieldResolver =
    Arc<dyn Fn(ResolveArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Picks the concrete type name of a value whose declared type is abstract.
pub type TypeResolver = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Everything a field resolver gets to work with.
pub struct ResolveArgs {
    /// The node, or nested object, the field is read from.
    pub source: Value,
    /// Declared argument defaults of the field.
    pub args: Map<String, Value>,
    /// Gives resolvers access to the node model, so they can issue queries.
    pub context: ResolverContext,
    pub field_name: String,
}

#[derive(Clone)]
pub struct ResolverContext {
    pub model: NodeModel,
}

/// The declared type of a field: a named type, possibly wrapped in a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    pub name: String,
    pub list: bool,
}

impl FieldType {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            list: false,
        }
    }

    pub fn list_of(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            list: true,
        }
    }
}

#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// The field cannot be read off stored data and has to go through the
    /// resolver before filtering or sorting on it.
    pub needs_resolution: bool,
    pub resolver: Option<FieldResolver>,
    /// Argument name → default value, passed to the resolver.
    pub args: Map<String, Value>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            needs_resolution: false,
            resolver: None,
            args: Map::new(),
        }
    }

    pub fn needs_resolution(mut self) -> Self {
        self.needs_resolution = true;
        self
    }

    /// Attaches a resolver. This doesn't imply `needs_resolution`, a field
    /// can have a resolver and still be served from stored data when it is
    /// only filtered on.
    pub fn resolver<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(ResolveArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.resolver = Some(Arc::new(move |args| Box::pin(resolver(args))));
        self
    }

    pub fn arg(mut self, name: impl Into<String>, default: Value) -> Self {
        self.args.insert(name.into(), default);
        self
    }
}

impl Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("needs_resolution", &self.needs_resolution)
            .field("resolver", &self.resolver.as_ref().map(|_| "*"))
            .field("args", &self.args)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Object {
        interfaces: Vec<String>,
        /// Instances of this type are stored as nodes.
        node: bool,
    },
    Interface,
    Union {
        members: Vec<String>,
    },
}

#[derive(Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub fields: BTreeMap<String, FieldDef>,
    pub resolve_type: Option<TypeResolver>,
}

impl TypeDef {
    fn with_kind(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: BTreeMap::new(),
            resolve_type: None,
        }
    }

    /// A plain object type, used for values nested inside nodes.
    pub fn object(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            TypeKind::Object {
                interfaces: vec![],
                node: false,
            },
        )
    }

    /// An object type whose instances live in the store as nodes.
    pub fn node(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            TypeKind::Object {
                interfaces: vec![],
                node: true,
            },
        )
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::Interface)
    }

    pub fn union<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        Self::with_kind(name, TypeKind::Union { members })
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        if let TypeKind::Object { interfaces, .. } = &mut self.kind {
            interfaces.push(interface.into());
        }
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn resolve_type<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.resolve_type = Some(Arc::new(resolve));
        self
    }

    pub fn is_abstract(&self) -> bool {
        !matches!(self.kind, TypeKind::Object { .. })
    }
}

impl Debug for TypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// The field metadata table: type name → field name → field definition.
///
/// Built once when the schema is registered and never modified afterwards.
///
/// ```rust
/// use hauchiwa_query::{FieldDef, FieldType, Schema, TypeDef};
///
/// let schema = Schema::builder()
///     .add_type(TypeDef::interface("Content"))
///     .add_type(
///         TypeDef::node("Post")
///             .implements("Content")
///             .field(FieldDef::new("title", FieldType::named("String"))),
///     )
///     .finish();
///
/// assert_eq!(schema.node_type_names("Content"), vec!["Post"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<String, TypeDef>,
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<TypeDef>,
}

impl SchemaBuilder {
    pub fn add_type(mut self, def: TypeDef) -> Self {
        self.types.push(def);
        self
    }

    pub fn finish(self) -> Schema {
        Schema {
            types: self
                .types
                .into_iter()
                .map(|def| (def.name.clone(), def))
                .collect(),
        }
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.fields.get(field)
    }

    pub fn needs_resolution(&self, type_name: &str, field: &str) -> bool {
        self.field(type_name, field)
            .is_some_and(|field| field.needs_resolution)
    }

    /// Object, interface and union types are composite. Anything not
    /// registered is a scalar.
    pub fn is_composite(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Concrete object types a value of type `name` can be.
    pub fn possible_types(&self, name: &str) -> Vec<&str> {
        let Some(def) = self.types.get(name) else {
            return vec![];
        };

        let mut names: Vec<&str> = match &def.kind {
            TypeKind::Object { .. } => vec![def.name.as_str()],
            TypeKind::Interface => self
                .types
                .values()
                .filter(|other| match &other.kind {
                    TypeKind::Object { interfaces, .. } => interfaces.iter().any(|i| i == name),
                    _ => false,
                })
                .map(|other| other.name.as_str())
                .collect(),
            TypeKind::Union { members } => members
                .iter()
                .filter(|member| self.types.contains_key(member.as_str()))
                .map(String::as_str)
                .collect(),
        };

        names.sort_unstable();
        names
    }

    /// Concrete node types a query against `name` may match.
    pub fn node_type_names(&self, name: &str) -> Vec<String> {
        self.possible_types(name)
            .into_iter()
            .filter(|possible| {
                matches!(
                    self.types.get(*possible).map(|def| &def.kind),
                    Some(TypeKind::Object { node: true, .. })
                )
            })
            .map(String::from)
            .collect()
    }

    /// The concrete type of `value`, given its declared type. Abstract types
    /// ask their `resolve_type` callback, or fall back to `internal.type`.
    pub fn concrete_type<'a>(&'a self, name: &'a str, value: &Value) -> Option<&'a str> {
        let def = self.types.get(name)?;

        if !def.is_abstract() {
            return Some(def.name.as_str());
        }

        let concrete = match &def.resolve_type {
            Some(resolve) => resolve(value),
            None => value
                .get(INTERNAL)
                .and_then(|internal| internal.get("type"))
                .and_then(Value::as_str)
                .map(String::from),
        }?;

        self.possible_types(name)
            .into_iter()
            .find(|possible| *possible == concrete)
    }
}
