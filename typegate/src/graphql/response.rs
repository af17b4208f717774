use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A graphql primary response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        extensions: Map<ByteString, Value>,
    ) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::json_ext::Path;

    #[test]
    fn partial_response_keeps_data_and_errors() {
        let response = Response::builder()
            .data(json!({ "users": null, "posts": [] }))
            .error(
                Error::builder()
                    .message("denied")
                    .path(Path::from("/users"))
                    .extension_code("AUTHORIZATION_DENIED")
                    .build(),
            )
            .build();
        let value = serde_json_bytes::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "data": { "users": null, "posts": [] },
                "errors": [{
                    "message": "denied",
                    "path": ["users"],
                    "extensions": { "code": "AUTHORIZATION_DENIED" }
                }]
            })
        );
    }
}
