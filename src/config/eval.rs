//! Expression evaluation against a scope of exported values.
//!
//! A [`Scope`] is a tree of JSON values keyed by reference segments. Node
//! exports are inserted under the node-ID path (`testkit.count.inc` →
//! `{"count": 5}`), so a reference `testkit.count.inc.count` resolves by a
//! plain path walk. Synthetic bindings such as `argument.<name>.value` are
//! inserted the same way.

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

use super::ast::{Body, Expr};

#[derive(Debug, Error, Diagnostic)]
pub enum EvalError {
    #[error("could not resolve reference \"{path}\"")]
    #[diagnostic(
        code(tributary::config::unknown_reference),
        help("References must point at the export of another node in scope.")
    )]
    UnknownReference { path: String },

    #[error("invalid operand: {message}")]
    #[diagnostic(code(tributary::config::type_mismatch))]
    TypeMismatch { message: String },
}

/// Mapping from reference prefixes to currently available exports.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: Map<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value at a nested dotted path, creating intermediate
    /// objects as needed. An existing non-object intermediate is replaced.
    pub fn insert_at(&mut self, path: &[&str], value: Value) {
        if path.is_empty() {
            return;
        }
        let mut current = &mut self.variables;
        for segment in &path[..path.len() - 1] {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("entry coerced to object");
        }
        current.insert(path[path.len() - 1].to_string(), value);
    }

    /// Insert a node's exports under its dotted node-ID.
    pub fn insert_exports(&mut self, node_id: &str, exports: Value) {
        let segments: Vec<&str> = node_id.split('.').collect();
        self.insert_at(&segments, exports);
    }

    pub fn lookup(&self, path: &[String]) -> Option<&Value> {
        let mut current = self.variables.get(path.first()?)?;
        for segment in &path[1..] {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

/// Evaluate a single expression against the scope.
pub fn evaluate_expr(scope: &Scope, expr: &Expr) -> Result<Value, EvalError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(n) => Ok(Value::from(*n)),
        Expr::Float(f) => Ok(serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_expr(scope, item)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (key, value) in fields {
                out.insert(key.clone(), evaluate_expr(scope, value)?);
            }
            Ok(Value::Object(out))
        }
        Expr::Ref(path) => scope
            .lookup(path)
            .cloned()
            .ok_or_else(|| EvalError::UnknownReference {
                path: path.join("."),
            }),
        Expr::Neg(inner) => {
            let value = evaluate_expr(scope, inner)?;
            match &value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(-i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(serde_json::Number::from_f64(-f)
                            .map(Value::Number)
                            .unwrap_or(Value::Null))
                    } else {
                        Err(EvalError::TypeMismatch {
                            message: format!("cannot negate {n}"),
                        })
                    }
                }
                other => Err(EvalError::TypeMismatch {
                    message: format!("cannot negate {other}"),
                }),
            }
        }
    }
}

/// Evaluate a block body into an argument object.
///
/// Attributes become top-level fields; nested blocks become nested objects
/// keyed by block name (and label, when present), which is how argument
/// structs see `basic_auth { .. }` sub-blocks.
pub fn evaluate_body(scope: &Scope, body: &Body) -> Result<Map<String, Value>, EvalError> {
    let mut out = Map::new();
    for attr in &body.attrs {
        out.insert(attr.name.clone(), evaluate_expr(scope, &attr.expr)?);
    }
    for block in &body.blocks {
        let value = Value::Object(evaluate_body(scope, &block.body)?);
        match &block.label {
            Some(label) => {
                let entry = out
                    .entry(block.name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(object) = entry.as_object_mut() {
                    object.insert(label.clone(), value);
                }
            }
            None => {
                out.insert(block.name.clone(), value);
            }
        }
    }
    Ok(out)
}
