//! Assembles resolved stages into the response document.

use super::execution::Resolved;
use super::execution::ResolvedObject;
use super::ShapeNode;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Walks the response shape of a plan over resolved values.
///
/// Every shape position referencing a failed stage becomes `null` with an
/// error located at that position, so a stage shared by several response
/// keys reports its failure once per key.
#[derive(Default)]
pub(crate) struct Composer {
    errors: Vec<graphql::Error>,
}

impl Composer {
    pub(crate) fn compose(
        shape: &[ShapeNode],
        root: &ResolvedObject,
    ) -> (Value, Vec<graphql::Error>) {
        let mut composer = Composer::default();
        let data = composer.object(shape, root, &Path::empty());
        (Value::Object(data), composer.errors)
    }

    fn object(&mut self, shape: &[ShapeNode], object: &ResolvedObject, path: &Path) -> Object {
        let mut data = Object::new();
        for node in shape {
            let Some(key) = &node.response_key else {
                continue;
            };
            let path = path.push_key(key.as_str());
            let value = match object.fields.get(&node.stage) {
                Some(resolved) => self.value(node, resolved, &path),
                None => Value::Null,
            };
            data.insert(key.as_str(), value);
        }
        data
    }

    fn value(&mut self, node: &ShapeNode, resolved: &Resolved, path: &Path) -> Value {
        match resolved {
            Resolved::Leaf(value) => value.clone(),
            Resolved::Object(object) => Value::Object(self.object(&node.children, object, path)),
            Resolved::List(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| self.value(node, item, &path.push_index(index)))
                    .collect(),
            ),
            Resolved::Branch { stage, object } => {
                let data = node
                    .children
                    .iter()
                    .find(|branch| branch.response_key.is_none() && &branch.stage == stage)
                    .map(|branch| self.object(&branch.children, object, path))
                    .unwrap_or_default();
                Value::Object(data)
            }
            Resolved::Failed(error) => {
                self.errors.push(error.to_graphql_error(Some(path.clone())));
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json_bytes::json;

    use super::*;
    use crate::error::StageError;
    use crate::query_planner::QueryPlanner;
    use crate::query_planner::StageId;
    use crate::test_utils::blog_schema;

    fn object(fields: Vec<(&str, Resolved)>) -> ResolvedObject {
        ResolvedObject {
            fields: fields
                .into_iter()
                .map(|(id, resolved)| (StageId::from(id), resolved))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn aliases_and_lists() {
        let schema = blog_schema();
        let plan = QueryPlanner::new(&schema, 16)
            .plan(
                "{ people: users { id name } }",
                None,
                &Object::new(),
                None,
            )
            .unwrap();
        let root = object(vec![(
            "users",
            Resolved::List(vec![Resolved::Object(object(vec![
                ("users.id", Resolved::Leaf(json!(1))),
                ("users.name", Resolved::Leaf(json!("Ada"))),
            ]))]),
        )]);
        let (data, errors) = Composer::compose(&plan.shape, &root);
        assert_eq!(data, json!({ "people": [{ "id": 1, "name": "Ada" }] }));
        assert!(errors.is_empty());
    }

    #[test]
    fn failures_become_null_with_a_located_error() {
        let schema = blog_schema();
        let plan = QueryPlanner::new(&schema, 16)
            .plan("{ users { id } failing { posts } }", None, &Object::new(), None)
            .unwrap();
        let error = StageError::Runtime {
            stage: "failing".to_string(),
            runtime: "deno".to_string(),
            reason: "boom".to_string(),
        };
        let root = object(vec![
            ("users", Resolved::List(vec![])),
            ("failing", Resolved::Failed(error)),
        ]);
        let (data, errors) = Composer::compose(&plan.shape, &root);
        assert_eq!(data, json!({ "users": [], "failing": null }));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, Some(Path::from("failing")));
        assert_eq!(errors[0].extension_code().as_deref(), Some("RUNTIME_ERROR"));
    }

    #[test]
    fn branches_use_their_own_shape() {
        let schema = blog_schema();
        let plan = QueryPlanner::new(&schema, 16)
            .plan(
                r#"{ search(term: "a") { __typename ... on Post { title } } }"#,
                None,
                &Object::new(),
                None,
            )
            .unwrap();
        let root = object(vec![(
            "search",
            Resolved::List(vec![Resolved::Branch {
                stage: StageId::from("search.$Post"),
                object: object(vec![
                    ("search.$Post.__typename", Resolved::Leaf(json!("Post"))),
                    ("search.$Post.title", Resolved::Leaf(json!("First"))),
                ]),
            }]),
        )]);
        let (data, _) = Composer::compose(&plan.shape, &root);
        assert_eq!(
            data,
            json!({ "search": [{ "__typename": "Post", "title": "First" }] })
        );
    }
}
