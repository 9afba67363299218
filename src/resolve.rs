use anyhow::anyhow;
use futures::future::{BoxFuture, try_join_all};
use serde_json::{Map, Value};

use crate::model::NodeModel;
use crate::schema::{FieldDef, ResolveArgs, ResolverContext};
use crate::shape::{FieldEntry, FieldShape};

/// Computes the fields of `resolve_fields` on `source`, descending into
/// composite values, and returns them restricted to what `query_fields`
/// asks for.
///
/// Fields requested by the query which don't need resolution are picked up
/// too, as long as the source carries them.
pub(crate) fn resolve_recursive<'a>(
    model: &'a NodeModel,
    source: Value,
    type_name: &'a str,
    query_fields: &'a FieldShape,
    resolve_fields: &'a FieldShape,
) -> BoxFuture<'a, anyhow::Result<Map<String, Value>>> {
    Box::pin(async move {
        let schema = model.schema();
        let mut resolved = Map::new();

        for (name, to_resolve) in resolve_fields {
            let field = schema.field(type_name, name);
            let mut value = resolve_field(model, &source, field, name).await?;

            if let (Some(field), Some(FieldEntry::Nested(query))) = (field, query_fields.get(name))
                && !value.is_null()
                && schema.is_composite(&field.ty.name)
            {
                let empty = FieldShape::new();
                let nested = to_resolve.nested().unwrap_or(&empty);

                value = match value {
                    Value::Array(items) if field.ty.list => {
                        let items = items.into_iter().map(|item| async move {
                            if item.is_null() {
                                return Ok(Value::Null);
                            }
                            let inner = concrete_type(model, field, name, &item)?;
                            let fields =
                                resolve_recursive(model, item, inner, query, nested).await?;
                            anyhow::Ok(Value::Object(fields))
                        });
                        Value::Array(try_join_all(items).await?)
                    }
                    value if !field.ty.list => {
                        let inner = concrete_type(model, field, name, &value)?;
                        Value::Object(resolve_recursive(model, value, inner, query, nested).await?)
                    }
                    value => value,
                };
            }

            if !value.is_null() {
                resolved.insert(name.clone(), value);
            }
        }

        for name in query_fields.keys() {
            if resolve_fields.contains(name) {
                continue;
            }

            if source.get(name).is_some_and(|value| !value.is_null()) {
                let field = schema.field(type_name, name);
                let value = resolve_field(model, &source, field, name).await?;
                if !value.is_null() {
                    resolved.insert(name.to_string(), value);
                }
            }
        }

        resolved.retain(|name, _| query_fields.contains(name));
        Ok(resolved)
    })
}

/// Runs the registered resolver of a field, or reads the property off
/// `source` when there is none.
pub(crate) async fn resolve_field(
    model: &NodeModel,
    source: &Value,
    field: Option<&FieldDef>,
    name: &str,
) -> anyhow::Result<Value> {
    let Some(resolver) = field.and_then(|field| field.resolver.as_ref()) else {
        return Ok(source.get(name).cloned().unwrap_or(Value::Null));
    };

    let args = ResolveArgs {
        source: source.clone(),
        args: field.map(|field| field.args.clone()).unwrap_or_default(),
        context: ResolverContext {
            model: model.clone(),
        },
        field_name: name.to_string(),
    };

    resolver(args).await
}

fn concrete_type<'a>(
    model: &'a NodeModel,
    field: &'a FieldDef,
    name: &str,
    value: &Value,
) -> anyhow::Result<&'a str> {
    model
        .schema()
        .concrete_type(&field.ty.name, value)
        .ok_or_else(|| {
            anyhow!(
                "Cannot determine the concrete type of field '{name}' of abstract type '{}'",
                field.ty.name
            )
        })
}
