//! Syntax tree for the block-structured configuration language.
//!
//! A configuration file is a sequence of [`Block`]s. Each block has a dotted
//! name (`import.file`), an optional string label, and a body of attributes
//! and nested blocks. Body spans record the byte range of the text between
//! the braces so that module templates can be sliced verbatim out of the
//! source they were parsed from.

use std::fmt;

/// Byte range of a body within its source text, exclusive of the braces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Slice the spanned text out of the text it was parsed from.
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// A named, optionally labeled declaration with a body.
///
/// Block identity is `(name, label)`; [`Block::id`] renders it as the
/// dotted node-ID string used throughout the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Dotted block name, e.g. `import.file` or `metrics.remote_queue`.
    pub name: String,
    /// Optional label, e.g. the `"inc"` in `testkit.count "inc" { .. }`.
    pub label: Option<String>,
    pub body: Body,
}

impl Block {
    /// The node-ID for this block: `name` or `name.label`.
    pub fn id(&self) -> String {
        match &self.label {
            Some(label) => format!("{}.{}", self.name, label),
            None => self.name.clone(),
        }
    }

    /// First dot-separated segment of the block name.
    pub fn first_segment(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} \"{}\"", self.name, label),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The contents between a block's braces.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub attrs: Vec<Attribute>,
    pub blocks: Vec<Block>,
    /// Byte range of the body text, exclusive of the surrounding braces.
    pub span: Span,
}

impl Body {
    /// Look up an attribute by name.
    pub fn attr(&self, name: &str) -> Option<&Expr> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.expr)
    }
}

/// A single `name = expr` assignment inside a body.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub expr: Expr,
}

/// An expression on the right-hand side of an attribute.
///
/// The language is deliberately call-free: values are literals, containers,
/// negations of numbers, or references of the form `a.b.c.field` resolved
/// against the evaluation scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    /// Dotted reference into the scope, e.g. `testkit.count.inc.count`.
    Ref(Vec<String>),
    /// Unary negation; valid on numbers only.
    Neg(Box<Expr>),
}

impl Expr {
    /// Collect every reference path reachable from this expression.
    pub fn references<'a>(&'a self, out: &mut Vec<&'a [String]>) {
        match self {
            Expr::Ref(path) => out.push(path),
            Expr::Array(items) => {
                for item in items {
                    item.references(out);
                }
            }
            Expr::Object(fields) => {
                for (_, value) in fields {
                    value.references(out);
                }
            }
            Expr::Neg(inner) => inner.references(out),
            _ => {}
        }
    }
}

/// Collect every reference path appearing anywhere in a body, including
/// nested blocks. Used by the controller to derive dependency edges.
pub fn body_references(body: &Body) -> Vec<&[String]> {
    let mut out = Vec::new();
    collect_body_refs(body, &mut out);
    out
}

fn collect_body_refs<'a>(body: &'a Body, out: &mut Vec<&'a [String]>) {
    for attr in &body.attrs {
        attr.expr.references(out);
    }
    for block in &body.blocks {
        collect_body_refs(&block.body, out);
    }
}
