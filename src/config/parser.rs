//! Lexer and recursive-descent parser for the configuration language.
//!
//! Produces a list of top-level [`Block`]s from source text. Body spans are
//! recorded so callers can slice module templates verbatim out of the input.

use miette::Diagnostic;
use thiserror::Error;

use super::ast::{Attribute, Block, Body, Expr, Span};

#[derive(Debug, Error, Diagnostic)]
#[error("parse error at {line}:{col}: {message}")]
#[diagnostic(
    code(tributary::config::parse),
    help("Check the configuration syntax near the reported position.")
)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

/// Parse source text into its top-level blocks.
pub fn parse(source: &str) -> Result<Vec<Block>, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut blocks = Vec::new();
    while !parser.at_eof() {
        blocks.push(parser.block()?);
    }
    Ok(blocks)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    /// A bare number-with-unit token such as `10ms` or `1m30s`; surfaced as
    /// a string value and decoded by argument structs.
    DurationLike(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Eq,
    Dot,
    Minus,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    /// Byte offset of the first character of the token.
    offset: usize,
    line: u32,
    col: u32,
}

fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let mut line = 1u32;
    let mut col = 1u32;

    macro_rules! push {
        ($tok:expr, $offset:expr, $line:expr, $col:expr) => {
            tokens.push(Token {
                tok: $tok,
                offset: $offset,
                line: $line,
                col: $col,
            })
        };
    }

    while i < bytes.len() {
        let c = bytes[i] as char;
        let (tok_line, tok_col, tok_offset) = (line, col, i);
        match c {
            '\n' => {
                i += 1;
                line += 1;
                col = 1;
            }
            ' ' | '\t' | '\r' => {
                i += 1;
                col += 1;
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '{' => {
                push!(Tok::LBrace, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '}' => {
                push!(Tok::RBrace, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '[' => {
                push!(Tok::LBracket, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            ']' => {
                push!(Tok::RBracket, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            ',' => {
                push!(Tok::Comma, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '=' => {
                push!(Tok::Eq, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '.' => {
                push!(Tok::Dot, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '-' => {
                push!(Tok::Minus, tok_offset, tok_line, tok_col);
                i += 1;
                col += 1;
            }
            '"' => {
                let mut out = String::new();
                i += 1;
                col += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(ParseError {
                            message: "unterminated string literal".into(),
                            line: tok_line,
                            col: tok_col,
                        });
                    }
                    match bytes[i] as char {
                        '"' => {
                            i += 1;
                            col += 1;
                            break;
                        }
                        '\\' => {
                            i += 1;
                            col += 1;
                            if i >= bytes.len() {
                                return Err(ParseError {
                                    message: "unterminated escape sequence".into(),
                                    line: tok_line,
                                    col: tok_col,
                                });
                            }
                            let escaped = match bytes[i] as char {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '"' => '"',
                                '\\' => '\\',
                                other => {
                                    return Err(ParseError {
                                        message: format!("unknown escape sequence \\{other}"),
                                        line: tok_line,
                                        col: tok_col,
                                    });
                                }
                            };
                            out.push(escaped);
                            i += 1;
                            col += 1;
                        }
                        '\n' => {
                            return Err(ParseError {
                                message: "unterminated string literal".into(),
                                line: tok_line,
                                col: tok_col,
                            });
                        }
                        other if other.is_ascii() => {
                            out.push(other);
                            i += 1;
                            col += 1;
                        }
                        _ => {
                            // Multi-byte character: decode it properly
                            // instead of treating the lead byte as a char.
                            if let Some(ch) = source[i..].chars().next() {
                                out.push(ch);
                                i += ch.len_utf8();
                                col += 1;
                            }
                        }
                    }
                }
                push!(Tok::Str(out), tok_offset, tok_line, tok_col);
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                    col += 1;
                }
                let mut is_float = false;
                if i + 1 < bytes.len()
                    && bytes[i] == b'.'
                    && (bytes[i + 1] as char).is_ascii_digit()
                {
                    is_float = true;
                    i += 1;
                    col += 1;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                        i += 1;
                        col += 1;
                    }
                }
                // A trailing alphabetic run turns the number into a
                // duration-like token: 10ms, 1m30s, 2h.
                if i < bytes.len() && (bytes[i] as char).is_ascii_alphabetic() {
                    while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                        i += 1;
                        col += 1;
                    }
                    let text = &source[start..i];
                    push!(Tok::DurationLike(text.to_string()), tok_offset, tok_line, tok_col);
                } else if is_float {
                    let value: f64 = source[start..i].parse().map_err(|_| ParseError {
                        message: format!("invalid float literal {}", &source[start..i]),
                        line: tok_line,
                        col: tok_col,
                    })?;
                    push!(Tok::Float(value), tok_offset, tok_line, tok_col);
                } else {
                    let value: i64 = source[start..i].parse().map_err(|_| ParseError {
                        message: format!("invalid integer literal {}", &source[start..i]),
                        line: tok_line,
                        col: tok_col,
                    })?;
                    push!(Tok::Int(value), tok_offset, tok_line, tok_col);
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        i += 1;
                        col += 1;
                    } else {
                        break;
                    }
                }
                push!(
                    Tok::Ident(source[start..i].to_string()),
                    tok_offset,
                    tok_line,
                    tok_col
                );
            }
            other => {
                return Err(ParseError {
                    message: format!("unexpected character {other:?}"),
                    line: tok_line,
                    col: tok_col,
                });
            }
        }
    }
    tokens.push(Token {
        tok: Tok::Eof,
        offset: source.len(),
        line,
        col,
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn at_eof(&self) -> bool {
        matches!(self.current().tok, Tok::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let token = self.current();
        ParseError {
            message: message.into(),
            line: token.line,
            col: token.col,
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match &self.current().tok {
            Tok::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found {other:?}"))),
        }
    }

    /// Parse a dotted name: `ident (. ident)*`.
    fn dotted_name(&mut self) -> Result<Vec<String>, ParseError> {
        let mut segments = vec![self.expect_ident()?];
        while matches!(self.current().tok, Tok::Dot) {
            self.advance();
            segments.push(self.expect_ident()?);
        }
        Ok(segments)
    }

    fn block(&mut self) -> Result<Block, ParseError> {
        let name = self.dotted_name()?.join(".");
        let label = match &self.current().tok {
            Tok::Str(label) => {
                let label = label.clone();
                self.advance();
                Some(label)
            }
            _ => None,
        };
        let body = self.body()?;
        Ok(Block { name, label, body })
    }

    /// Parse `{ ... }`, dispatching each entry to attribute or nested block.
    fn body(&mut self) -> Result<Body, ParseError> {
        if !matches!(self.current().tok, Tok::LBrace) {
            return Err(self.error("expected '{'"));
        }
        let open = self.advance();
        let span_start = open.offset + 1;

        let mut attrs = Vec::new();
        let mut blocks = Vec::new();
        loop {
            match &self.current().tok {
                Tok::RBrace => {
                    let close = self.advance();
                    return Ok(Body {
                        attrs,
                        blocks,
                        span: Span {
                            start: span_start,
                            end: close.offset,
                        },
                    });
                }
                Tok::Eof => return Err(self.error("unexpected end of input, expected '}'")),
                Tok::Ident(_) => {
                    let segments = self.dotted_name()?;
                    match &self.current().tok {
                        Tok::Eq if segments.len() == 1 => {
                            self.advance();
                            let expr = self.expr()?;
                            attrs.push(Attribute {
                                name: segments.into_iter().next().unwrap(),
                                expr,
                            });
                        }
                        Tok::Eq => {
                            return Err(self.error("attribute names cannot be dotted"));
                        }
                        _ => {
                            let label = match &self.current().tok {
                                Tok::Str(label) => {
                                    let label = label.clone();
                                    self.advance();
                                    Some(label)
                                }
                                _ => None,
                            };
                            let body = self.body()?;
                            blocks.push(Block {
                                name: segments.join("."),
                                label,
                                body,
                            });
                        }
                    }
                }
                other => {
                    return Err(self.error(format!(
                        "expected attribute or block, found {other:?}"
                    )));
                }
            }
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        match self.current().tok.clone() {
            Tok::Minus => {
                self.advance();
                let inner = self.expr()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Tok::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            Tok::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            Tok::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            Tok::DurationLike(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    if matches!(self.current().tok, Tok::RBracket) {
                        self.advance();
                        break;
                    }
                    items.push(self.expr()?);
                    match self.current().tok {
                        Tok::Comma => {
                            self.advance();
                        }
                        Tok::RBracket => {}
                        _ => return Err(self.error("expected ',' or ']' in array")),
                    }
                }
                Ok(Expr::Array(items))
            }
            Tok::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                loop {
                    match self.current().tok.clone() {
                        Tok::RBrace => {
                            self.advance();
                            break;
                        }
                        Tok::Ident(key) => {
                            self.advance();
                            if !matches!(self.current().tok, Tok::Eq) {
                                return Err(self.error("expected '=' after object key"));
                            }
                            self.advance();
                            fields.push((key, self.expr()?));
                        }
                        Tok::Str(key) => {
                            self.advance();
                            if !matches!(self.current().tok, Tok::Eq) {
                                return Err(self.error("expected '=' after object key"));
                            }
                            self.advance();
                            fields.push((key, self.expr()?));
                        }
                        other => {
                            return Err(self.error(format!(
                                "expected object key or '}}', found {other:?}"
                            )));
                        }
                    }
                    if matches!(self.current().tok, Tok::Comma) {
                        self.advance();
                    }
                }
                Ok(Expr::Object(fields))
            }
            Tok::Ident(first) => {
                match first.as_str() {
                    "true" => {
                        self.advance();
                        Ok(Expr::Bool(true))
                    }
                    "false" => {
                        self.advance();
                        Ok(Expr::Bool(false))
                    }
                    "null" => {
                        self.advance();
                        Ok(Expr::Null)
                    }
                    _ => {
                        let path = self.dotted_name()?;
                        Ok(Expr::Ref(path))
                    }
                }
            }
            other => Err(self.error(format!("expected expression, found {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labeled_blocks_with_attributes() {
        let source = r#"
            testkit.count "inc" {
                frequency = "10ms"
                max = 10
            }
        "#;
        let blocks = parse(source).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "testkit.count");
        assert_eq!(blocks[0].label.as_deref(), Some("inc"));
        assert_eq!(blocks[0].body.attr("max"), Some(&Expr::Int(10)));
        assert_eq!(
            blocks[0].body.attr("frequency"),
            Some(&Expr::Str("10ms".into()))
        );
    }

    #[test]
    fn bare_durations_lex_as_strings() {
        let blocks = parse("a { poll_frequency = 1m30s }").unwrap();
        assert_eq!(
            blocks[0].body.attr("poll_frequency"),
            Some(&Expr::Str("1m30s".into()))
        );
    }

    #[test]
    fn parses_references_and_negation() {
        let blocks = parse("sum { input = testkit.count.inc.count\n neg = -10 }").unwrap();
        assert_eq!(
            blocks[0].body.attr("input"),
            Some(&Expr::Ref(vec![
                "testkit".into(),
                "count".into(),
                "inc".into(),
                "count".into()
            ]))
        );
        assert_eq!(
            blocks[0].body.attr("neg"),
            Some(&Expr::Neg(Box::new(Expr::Int(10))))
        );
    }

    #[test]
    fn body_span_slices_verbatim_text() {
        let source = "declare \"test\" {\n  export \"output\" { value = 1 }\n}";
        let blocks = parse(source).unwrap();
        let inner = blocks[0].body.span.slice(source);
        assert!(inner.contains("export \"output\""));
        assert!(!inner.contains("declare"));
    }

    #[test]
    fn nested_blocks_and_objects() {
        let source = r#"
            import.http "remote" {
                url = "https://example.com/module"
                headers = { accept = "text/plain" }
                basic_auth {
                    username = "u"
                    password = "p"
                }
            }
        "#;
        let blocks = parse(source).unwrap();
        let block = &blocks[0];
        assert_eq!(block.name, "import.http");
        assert_eq!(block.body.blocks.len(), 1);
        assert_eq!(block.body.blocks[0].name, "basic_auth");
        match block.body.attr("headers") {
            Some(Expr::Object(fields)) => assert_eq!(fields[0].0, "accept"),
            other => panic!("unexpected headers expr: {other:?}"),
        }
    }

    #[test]
    fn rejects_unterminated_block() {
        let err = parse("a {").unwrap_err();
        assert!(err.message.contains("unexpected end of input"));
    }

    #[test]
    fn line_comments_are_skipped() {
        let blocks = parse("// top\na { // trailing\n  x = 1\n}\n").unwrap();
        assert_eq!(blocks[0].body.attr("x"), Some(&Expr::Int(1)));
    }
}
