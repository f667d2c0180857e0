use super::{Capability, ParamSpec, RoutePattern};
use crate::error::GatewayError;
use http::Method;
use serde_json::Value;

/// Cap on the number of entries in an OpenAPI `paths` object.
pub const MAX_SPEC_PATHS: usize = 100;

/// HTTP verbs recognized in a path item, in dispatch order.
const VERBS: &[(&str, Method)] = &[
    ("get", Method::GET),
    ("post", Method::POST),
    ("put", Method::PUT),
    ("patch", Method::PATCH),
    ("delete", Method::DELETE),
];

/// Compile a parsed OpenAPI 3.x document into the ordered capability table.
///
/// One-shot, at registration (and again when a tenant is restored at
/// startup). Only the parts the gateway dispatches on are inspected: paths,
/// operations, parameters, and JSON request-body properties.
pub fn compile(spec: &Value) -> Result<Vec<Capability>, GatewayError> {
    let paths = match spec.get("paths") {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(GatewayError::Input(
                "OpenAPI spec has a non-object paths field".to_string(),
            ))
        }
        None => {
            return Err(GatewayError::Input(
                "OpenAPI spec has no paths".to_string(),
            ))
        }
    };

    if paths.is_empty() {
        return Err(GatewayError::Input(
            "OpenAPI spec has an empty paths object".to_string(),
        ));
    }
    if paths.len() > MAX_SPEC_PATHS {
        return Err(GatewayError::Input(format!(
            "OpenAPI spec has too many paths ({}, max {})",
            paths.len(),
            MAX_SPEC_PATHS
        )));
    }

    let mut table = Vec::new();
    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        for (verb, method) in VERBS {
            let Some(op) = item.get(*verb).and_then(|v| v.as_object()) else {
                continue;
            };

            let name = match op.get("operationId").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => derive_name(verb, path),
            };

            let body_allowed = *method != Method::GET && *method != Method::DELETE;
            let params = merge_params(op, body_allowed);

            let requires_session = op
                .get("x-requires-session")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            table.push(Capability {
                route: RoutePattern::for_name(&name),
                name,
                method: method.clone(),
                path_template: path.clone(),
                params,
                requires_session,
            });
        }
    }

    Ok(table)
}

/// Stable operation name for specs without an `operationId`:
/// `"{method}_{path}"` with non-alphanumerics collapsed to single
/// underscores and leading/trailing underscores trimmed.
fn derive_name(method: &str, path: &str) -> String {
    let raw = format!("{}_{}", method, path);
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Merge parameter specs from `operation.parameters` (query and path) and,
/// for body-bearing verbs, the JSON request-body schema properties. On a
/// name collision the first occurrence wins.
fn merge_params(
    op: &serde_json::Map<String, Value>,
    body_allowed: bool,
) -> Vec<(String, ParamSpec)> {
    let mut params: Vec<(String, ParamSpec)> = Vec::new();

    if let Some(list) = op.get("parameters").and_then(|v| v.as_array()) {
        for p in list {
            let Some(p) = p.as_object() else { continue };
            let location = p.get("in").and_then(|v| v.as_str()).unwrap_or("");
            if location != "query" && location != "path" {
                continue;
            }
            let Some(name) = p.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            if params.iter().any(|(n, _)| n == name) {
                continue;
            }
            let schema = p.get("schema").and_then(|v| v.as_object());
            params.push((
                name.to_string(),
                ParamSpec {
                    kind: schema_type(schema),
                    required: p.get("required").and_then(|v| v.as_bool()).unwrap_or(false),
                    enum_values: schema_enum(schema),
                    default: schema_default(schema),
                },
            ));
        }
    }

    if body_allowed {
        let body_schema = op
            .get("requestBody")
            .and_then(|v| v.get("content"))
            .and_then(|v| v.get("application/json"))
            .and_then(|v| v.get("schema"));

        if let Some(schema) = body_schema.and_then(|v| v.as_object()) {
            let required_names: Vec<&str> = schema
                .get("required")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();

            if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
                for (name, prop) in props {
                    if params.iter().any(|(n, _)| n == name) {
                        continue;
                    }
                    let prop = prop.as_object();
                    params.push((
                        name.clone(),
                        ParamSpec {
                            kind: schema_type(prop),
                            required: required_names.contains(&name.as_str()),
                            enum_values: schema_enum(prop),
                            default: schema_default(prop),
                        },
                    ));
                }
            }
        }
    }

    params
}

fn schema_type(schema: Option<&serde_json::Map<String, Value>>) -> String {
    schema
        .and_then(|s| s.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or("string")
        .to_string()
}

fn schema_enum(schema: Option<&serde_json::Map<String, Value>>) -> Option<Vec<Value>> {
    schema
        .and_then(|s| s.get("enum"))
        .and_then(|v| v.as_array())
        .cloned()
}

fn schema_default(schema: Option<&serde_json::Map<String, Value>>) -> Option<Value> {
    schema.and_then(|s| s.get("default")).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_spec(paths: Value) -> Value {
        json!({
            "openapi": "3.0.0",
            "info": { "title": "t", "version": "1" },
            "paths": paths,
        })
    }

    #[test]
    fn rejects_missing_paths() {
        let err = compile(&json!({"openapi": "3.0.0"})).unwrap_err();
        assert!(err.to_string().contains("no paths"));
    }

    #[test]
    fn rejects_non_object_paths() {
        let err = compile(&minimal_spec(json!(["/a"]))).unwrap_err();
        assert!(err.to_string().contains("non-object"));
    }

    #[test]
    fn rejects_empty_paths() {
        assert!(compile(&minimal_spec(json!({}))).is_err());
    }

    #[test]
    fn path_count_boundary() {
        let mut at_cap = serde_json::Map::new();
        for i in 0..MAX_SPEC_PATHS {
            at_cap.insert(format!("/p{}", i), json!({"get": {}}));
        }
        assert!(compile(&minimal_spec(Value::Object(at_cap.clone()))).is_ok());

        at_cap.insert("/one-too-many".to_string(), json!({"get": {}}));
        assert!(compile(&minimal_spec(Value::Object(at_cap))).is_err());
    }

    #[test]
    fn uses_operation_id() {
        let caps = compile(&minimal_spec(json!({
            "/items": { "get": { "operationId": "listItems" } }
        })))
        .unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "listItems");
        assert_eq!(caps[0].method, Method::GET);
        assert_eq!(caps[0].path_template, "/items");
    }

    #[test]
    fn derives_name_when_operation_id_missing() {
        let caps = compile(&minimal_spec(json!({
            "/items/{id}/tags": { "get": {} }
        })))
        .unwrap();
        assert_eq!(caps[0].name, "get_items_id_tags");
    }

    #[test]
    fn derive_name_collapses_runs_and_trims() {
        assert_eq!(derive_name("get", "/items"), "get_items");
        assert_eq!(derive_name("post", "/a//b--c/"), "post_a_b_c");
        assert_eq!(derive_name("get", "/"), "get");
    }

    #[test]
    fn verb_order_within_a_path() {
        let caps = compile(&minimal_spec(json!({
            "/items": {
                "delete": { "operationId": "del" },
                "get": { "operationId": "list" },
                "post": { "operationId": "create" }
            }
        })))
        .unwrap();
        let names: Vec<&str> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["list", "create", "del"]);
    }

    #[test]
    fn merges_query_path_and_body_params() {
        let caps = compile(&minimal_spec(json!({
            "/items/{id}": {
                "post": {
                    "operationId": "updateItem",
                    "parameters": [
                        { "name": "verbose", "in": "query",
                          "schema": { "type": "boolean", "default": false } },
                        { "name": "id", "in": "path", "required": true,
                          "schema": { "type": "integer" } },
                        { "name": "x-trace", "in": "header" }
                    ],
                    "requestBody": { "content": { "application/json": { "schema": {
                        "type": "object",
                        "required": ["title"],
                        "properties": {
                            "title": { "type": "string" },
                            "state": { "type": "string", "enum": ["open", "closed"] }
                        }
                    }}}}
                }
            }
        })))
        .unwrap();

        let cap = &caps[0];
        let names: Vec<&str> = cap.params.iter().map(|(n, _)| n.as_str()).collect();
        // Header params are ignored; merge order is query, path, body.
        assert_eq!(names, vec!["verbose", "id", "title", "state"]);

        let by_name = |n: &str| {
            cap.params
                .iter()
                .find(|(name, _)| name == n)
                .map(|(_, s)| s)
                .unwrap()
        };
        assert_eq!(by_name("verbose").kind, "boolean");
        assert_eq!(by_name("verbose").default, Some(json!(false)));
        assert!(by_name("id").required);
        assert!(by_name("title").required);
        assert!(!by_name("state").required);
        assert_eq!(
            by_name("state").enum_values,
            Some(vec![json!("open"), json!("closed")])
        );
    }

    #[test]
    fn get_and_delete_ignore_request_body() {
        let caps = compile(&minimal_spec(json!({
            "/items": {
                "get": {
                    "operationId": "listItems",
                    "requestBody": { "content": { "application/json": { "schema": {
                        "properties": { "filter": { "type": "string" } }
                    }}}}
                }
            }
        })))
        .unwrap();
        assert!(caps[0].params.is_empty());
    }

    #[test]
    fn session_extension_flag() {
        let caps = compile(&minimal_spec(json!({
            "/private": { "get": { "operationId": "secret", "x-requires-session": true } },
            "/public": { "get": { "operationId": "open" } }
        })))
        .unwrap();
        let secret = caps.iter().find(|c| c.name == "secret").unwrap();
        let open = caps.iter().find(|c| c.name == "open").unwrap();
        assert!(secret.requires_session);
        assert!(!open.requires_session);
    }
}
