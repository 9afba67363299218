use crate::schema::{FieldDef, Schema};
use crate::shape::{FieldEntry, FieldShape};

/// Restricts `fields` to the ones that have to go through a resolver.
///
/// A field needs resolution when its declaring type, or any of the concrete
/// node types the query may match, marks it so. Composite fields recurse
/// into their requested sub-fields, and once a field needs resolution every
/// field requested beneath it does too: a resolver's output is not
/// guaranteed to look like plain storage.
pub fn determine_resolvable_fields(
    schema: &Schema,
    type_name: &str,
    fields: &FieldShape,
    node_type_names: &[String],
) -> FieldShape {
    determine(schema, type_name, fields, node_type_names, false)
}

fn determine(
    schema: &Schema,
    type_name: &str,
    fields: &FieldShape,
    node_type_names: &[String],
    is_nested: bool,
) -> FieldShape {
    let mut resolvable = FieldShape::new();

    for (name, entry) in fields {
        let needs_resolution = schema.needs_resolution(type_name, name)
            || node_type_names
                .iter()
                .any(|concrete| schema.needs_resolution(concrete, name));

        if let (FieldEntry::Nested(nested), Some(field)) =
            (entry, find_field(schema, type_name, name, node_type_names))
        {
            let inner_type = field.ty.name.as_str();
            let inner_node_types = schema.node_type_names(inner_type);
            let inner = determine(
                schema,
                inner_type,
                nested,
                &inner_node_types,
                is_nested || needs_resolution,
            );

            if !inner.is_empty() {
                resolvable.insert(name.clone(), FieldEntry::Nested(inner));
                continue;
            }
        }

        if needs_resolution || is_nested {
            resolvable.insert(name.clone(), FieldEntry::Leaf);
        }
    }

    resolvable
}

/// The field as declared on `type_name`, or on the first concrete type that
/// declares it when an interface leaves it out.
fn find_field<'a>(
    schema: &'a Schema,
    type_name: &str,
    name: &str,
    node_type_names: &[String],
) -> Option<&'a FieldDef> {
    schema.field(type_name, name).or_else(|| {
        node_type_names
            .iter()
            .find_map(|concrete| schema.field(concrete, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, TypeDef};

    fn schema() -> Schema {
        Schema::builder()
            .add_type(TypeDef::interface("Content").field(FieldDef::new(
                "slug",
                FieldType::named("String"),
            )))
            .add_type(
                TypeDef::node("Post")
                    .implements("Content")
                    .field(FieldDef::new("title", FieldType::named("String")))
                    .field(FieldDef::new("slug", FieldType::named("String")).needs_resolution())
                    .field(FieldDef::new("meta", FieldType::named("Meta")).needs_resolution())
                    .field(FieldDef::new("frontmatter", FieldType::named("Frontmatter")))
                    .field(FieldDef::new("author", FieldType::named("Author"))),
            )
            .add_type(TypeDef::node("Page").implements("Content"))
            .add_type(
                TypeDef::object("Meta")
                    .field(FieldDef::new("words", FieldType::named("Int")))
                    .field(FieldDef::new("tags", FieldType::list_of("Tag"))),
            )
            .add_type(
                TypeDef::object("Tag").field(FieldDef::new("name", FieldType::named("String"))),
            )
            .add_type(
                TypeDef::object("Frontmatter")
                    .field(FieldDef::new("title", FieldType::named("String")))
                    .field(FieldDef::new("date", FieldType::named("Date")).needs_resolution()),
            )
            .add_type(
                TypeDef::node("Author")
                    .field(FieldDef::new("name", FieldType::named("String")))
                    .field(FieldDef::new("avatar", FieldType::named("String")).needs_resolution()),
            )
            .finish()
    }

    fn post() -> Vec<String> {
        vec!["Post".to_string()]
    }

    #[test]
    fn test_plain_fields_skipped() {
        let fields = FieldShape::new().with_leaf("title");
        assert!(determine_resolvable_fields(&schema(), "Post", &fields, &post()).is_empty());
    }

    #[test]
    fn test_marked_leaf() {
        let fields = FieldShape::new().with_leaf("title").with_leaf("slug");
        let expected = FieldShape::new().with_leaf("slug");

        assert_eq!(
            determine_resolvable_fields(&schema(), "Post", &fields, &post()),
            expected
        );
    }

    #[test]
    fn test_downward_propagation() {
        let fields = FieldShape::from_path("meta.words");
        let expected = FieldShape::new().with_nested("meta", FieldShape::new().with_leaf("words"));

        assert_eq!(
            determine_resolvable_fields(&schema(), "Post", &fields, &post()),
            expected
        );

        let mut deep = FieldShape::from_path("meta.tags.name");
        deep.merge(&FieldShape::from_path("meta.words")).unwrap();

        assert_eq!(
            determine_resolvable_fields(&schema(), "Post", &deep, &post()),
            deep
        );
    }

    #[test]
    fn test_nested_marker_bubbles_up() {
        let mut fields = FieldShape::from_path("frontmatter.title");
        fields.merge(&FieldShape::from_path("frontmatter.date")).unwrap();
        fields.merge(&FieldShape::from_path("author.name")).unwrap();
        fields.merge(&FieldShape::from_path("author.avatar")).unwrap();

        let expected = FieldShape::new()
            .with_nested("frontmatter", FieldShape::new().with_leaf("date"))
            .with_nested("author", FieldShape::new().with_leaf("avatar"));

        assert_eq!(
            determine_resolvable_fields(&schema(), "Post", &fields, &post()),
            expected
        );
    }

    #[test]
    fn test_interface_consults_concrete_types() {
        let schema = schema();
        let fields = FieldShape::new().with_leaf("slug");
        let types = schema.node_type_names("Content");

        assert_eq!(
            determine_resolvable_fields(&schema, "Content", &fields, &types),
            fields
        );
        assert!(
            determine_resolvable_fields(&schema, "Content", &fields, &["Page".to_string()])
                .is_empty()
        );
    }
}
