pub mod compiler;
pub mod invoke;

pub use compiler::{compile, MAX_SPEC_PATHS};
pub use invoke::{invoke_upstream, CallArgs};

use http::Method;
use serde_json::{json, Value};

/// A single upstream operation derived from one OpenAPI `(path, method)`
/// pair. Compiled once at registration; the table order is the dispatch
/// order.
#[derive(Debug, Clone)]
pub struct Capability {
    /// Operation identifier (`operationId` or a stable derivation).
    pub name: String,
    pub method: Method,
    /// Upstream path with `{param}` placeholders.
    pub path_template: String,
    /// Parameter specs in merge order: query, path, then body properties.
    pub params: Vec<(String, ParamSpec)>,
    pub requires_session: bool,
    /// Gateway-side route under `<base>/agents/api/`.
    pub route: RoutePattern,
}

/// Shape of a single capability parameter as advertised in the manifest.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// JSON-schema type name; "string" when the spec does not say.
    pub kind: String,
    pub required: bool,
    pub enum_values: Option<Vec<Value>>,
    pub default: Option<Value>,
}

impl ParamSpec {
    fn manifest_entry(&self) -> Value {
        let mut entry = json!({
            "type": self.kind,
            "required": self.required,
        });
        if let Some(ref vals) = self.enum_values {
            entry["enum"] = Value::Array(vals.clone());
        }
        if let Some(ref d) = self.default {
            entry["default"] = d.clone();
        }
        entry
    }
}

impl Capability {
    /// Manifest projection: `{name, method, params, requires_session}`.
    pub fn manifest_entry(&self) -> Value {
        let mut params = serde_json::Map::new();
        for (name, spec) in &self.params {
            params.insert(name.clone(), spec.manifest_entry());
        }
        json!({
            "name": self.name,
            "method": self.method.as_str(),
            "params": params,
            "requires_session": self.requires_session,
        })
    }
}

/// One segment of a compiled gateway route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSeg {
    Literal(String),
    /// `:name` — matches exactly one segment and binds it into params.
    Param(String),
}

/// Compiled route pattern relative to `<base>/agents/api/`.
///
/// Derivation: a dotted name `a.b.c` becomes `/a/b/c`; the sentinel name
/// `detail` becomes `/detail/:id`; anything else is a single literal
/// segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    pub segments: Vec<RouteSeg>,
}

impl RoutePattern {
    pub fn for_name(name: &str) -> Self {
        let segments = if name == "detail" {
            vec![
                RouteSeg::Literal("detail".to_string()),
                RouteSeg::Param("id".to_string()),
            ]
        } else if name.contains('.') {
            name.split('.')
                .map(|s| RouteSeg::Literal(s.to_string()))
                .collect()
        } else {
            vec![RouteSeg::Literal(name.to_string())]
        };
        Self { segments }
    }

    /// Match `path_segments` (the part after `agents/api/`, already split
    /// on `/`). On success returns the `:param` bindings.
    pub fn matches(&self, path_segments: &[&str]) -> Option<Vec<(String, String)>> {
        if path_segments.len() != self.segments.len() {
            return None;
        }
        let mut bound = Vec::new();
        for (pat, seg) in self.segments.iter().zip(path_segments) {
            match pat {
                RouteSeg::Literal(lit) => {
                    if lit != seg {
                        return None;
                    }
                }
                RouteSeg::Param(name) => {
                    if seg.is_empty() {
                        return None;
                    }
                    bound.push((name.clone(), (*seg).to_string()));
                }
            }
        }
        Some(bound)
    }
}

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for seg in &self.segments {
            match seg {
                RouteSeg::Literal(lit) => write!(f, "/{}", lit)?,
                RouteSeg::Param(name) => write!(f, "/:{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_is_single_segment() {
        let p = RoutePattern::for_name("listItems");
        assert_eq!(p.to_string(), "/listItems");
        assert_eq!(p.matches(&["listItems"]), Some(vec![]));
        assert!(p.matches(&["other"]).is_none());
        assert!(p.matches(&["listItems", "extra"]).is_none());
    }

    #[test]
    fn dotted_name_expands_to_segments() {
        let p = RoutePattern::for_name("catalog.items.search");
        assert_eq!(p.to_string(), "/catalog/items/search");
        assert_eq!(p.matches(&["catalog", "items", "search"]), Some(vec![]));
        assert!(p.matches(&["catalog", "items"]).is_none());
    }

    #[test]
    fn detail_sentinel_binds_id() {
        let p = RoutePattern::for_name("detail");
        assert_eq!(p.to_string(), "/detail/:id");
        assert_eq!(
            p.matches(&["detail", "42"]),
            Some(vec![("id".to_string(), "42".to_string())])
        );
        assert!(p.matches(&["detail"]).is_none());
        assert!(p.matches(&["detail", ""]).is_none());
    }

    #[test]
    fn manifest_entry_shape() {
        let cap = Capability {
            name: "listItems".to_string(),
            method: Method::GET,
            path_template: "/items".to_string(),
            params: vec![(
                "limit".to_string(),
                ParamSpec {
                    kind: "integer".to_string(),
                    required: false,
                    enum_values: None,
                    default: Some(serde_json::json!(10)),
                },
            )],
            requires_session: false,
            route: RoutePattern::for_name("listItems"),
        };

        let entry = cap.manifest_entry();
        assert_eq!(entry["name"], "listItems");
        assert_eq!(entry["method"], "GET");
        assert_eq!(entry["requires_session"], false);
        assert_eq!(entry["params"]["limit"]["type"], "integer");
        assert_eq!(entry["params"]["limit"]["default"], 10);
        assert!(entry["params"]["limit"].get("enum").is_none());
    }
}
