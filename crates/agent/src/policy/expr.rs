//! Constrained expression language for policy conditions and transforms.
//!
//! Expressions are compiled once, at rule-load time, into a small AST. Only
//! three roots can be referenced (`tool`, `context`, `args`), only a fixed set
//! of methods can be called, and evaluation is a pure walk over JSON values:
//! there is no way to reach ambient runtime state or perform I/O.
//!
//! Supported syntax:
//!
//! ```text
//! tool.name.match(/delete|remove/i) && !context.readOnly
//! context.sessionCost >= context.maxSessionCost
//! ["deleteForm", "deleteRole"].includes(tool.name) or tool.method == "DELETE"
//! { ...args, limit: args.limit > 100 ? 100 : args.limit }
//! ```

use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use thiserror::Error;

const MAX_SOURCE_LEN: usize = 4_096;
const MAX_DEPTH: usize = 64;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Identifiers rejected anywhere in an expression, kept from the original
/// authoring guidance so that misuse gets a precise message.
const FORBIDDEN_IDENTIFIERS: &[&str] = &[
    "require",
    "import",
    "eval",
    "Function",
    "process",
    "global",
    "globalThis",
    "window",
    "this",
    "__proto__",
    "constructor",
    "prototype",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("expression is empty")]
    Empty,
    #[error("expression exceeds {MAX_SOURCE_LEN} characters")]
    TooLong,
    #[error("expression nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("forbidden identifier `{name}` at offset {offset}")]
    Forbidden { name: String, offset: usize },
    #[error("unexpected character `{ch}` at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unterminated regex literal starting at offset {0}")]
    UnterminatedRegex(usize),
    #[error("unsupported regex flag `{flag}` at offset {offset}")]
    UnsupportedRegexFlag { flag: char, offset: usize },
    #[error("invalid regex `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("invalid number literal `{literal}` at offset {offset}")]
    InvalidNumber { literal: String, offset: usize },
    #[error(
        "unknown identifier `{name}` at offset {offset}; only `tool`, `context` and `args` are in scope"
    )]
    UnknownIdentifier { name: String, offset: usize },
    #[error("unsupported method `{name}` at offset {offset}")]
    UnsupportedMethod { name: String, offset: usize },
    #[error("method `{name}` expects {expected} argument(s), found {found}")]
    Arity { name: String, expected: usize, found: usize },
    #[error("regex literal at offset {0} may only be used with `match` or `test`")]
    DetachedRegex(usize),
    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str, offset: usize },
    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("cannot read property `{property}` of null")]
    NullProperty { property: String },
    #[error("`{method}` expects a {expected} receiver, found {found}")]
    BadReceiver { method: &'static str, expected: &'static str, found: &'static str },
    #[error("`{method}` expects a {expected} argument, found {found}")]
    BadArgument { method: &'static str, expected: &'static str, found: &'static str },
    #[error("cannot compare {left} with {right}")]
    Incomparable { left: &'static str, right: &'static str },
    #[error("cannot negate {0}")]
    BadNegation(&'static str),
    #[error("spread operand must be an object, found {0}")]
    BadSpread(&'static str),
}

/// Read-only values an expression may reference.
#[derive(Clone, Copy, Debug)]
pub struct Bindings<'a> {
    pub tool: &'a Value,
    pub context: &'a Value,
    pub args: &'a Value,
}

#[derive(Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(CompileError::Empty);
        }
        if trimmed.len() > MAX_SOURCE_LEN {
            return Err(CompileError::TooLong);
        }

        let tokens = Lexer::new(trimmed).tokenize()?;
        let mut parser = Parser { tokens, position: 0, depth: 0 };
        let root = parser.parse_expression()?;
        if let Some(token) = parser.peek() {
            return Err(CompileError::UnexpectedToken {
                found: token.kind.describe(),
                expected: "end of expression",
                offset: token.offset,
            });
        }

        Ok(Self { source: trimmed.to_owned(), root })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, bindings: &Bindings<'_>) -> Result<Value, EvalError> {
        evaluate(&self.root, bindings)
    }

    /// Evaluates the expression and reduces the result to a boolean using
    /// JavaScript truthiness.
    pub fn is_satisfied(&self, bindings: &Bindings<'_>) -> Result<bool, EvalError> {
        self.evaluate(bindings).map(|value| truthy(&value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Root {
    Tool,
    Context,
    Args,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StringMethod {
    StartsWith,
    EndsWith,
    ToLowerCase,
    ToUpperCase,
}

#[derive(Clone, Debug)]
enum ObjectEntry {
    Field(String, Node),
    Spread(Node),
}

#[derive(Clone, Debug)]
enum Node {
    Literal(Value),
    Root(Root),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Matches(Box<Node>, Arc<Regex>),
    Includes(Box<Node>, Box<Node>),
    StringCall(Box<Node>, StringMethod, Vec<Node>),
    Not(Box<Node>),
    Negate(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
    Conditional(Box<Node>, Box<Node>, Box<Node>),
    Array(Vec<Node>),
    Object(Vec<ObjectEntry>),
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Regex { pattern: String, flags: String },
    Ident(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    Colon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Spread,
    Minus,
    Not,
    And,
    Or,
    Compare(CompareOp),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            Self::Number(value) => format!("number `{value}`"),
            Self::Str(value) => format!("string \"{value}\""),
            Self::Regex { pattern, .. } => format!("regex /{pattern}/"),
            Self::Ident(name) => format!("identifier `{name}`"),
            Self::True => "`true`".to_owned(),
            Self::False => "`false`".to_owned(),
            Self::Null => "`null`".to_owned(),
            Self::Dot => "`.`".to_owned(),
            Self::Comma => "`,`".to_owned(),
            Self::Colon => "`:`".to_owned(),
            Self::Question => "`?`".to_owned(),
            Self::LParen => "`(`".to_owned(),
            Self::RParen => "`)`".to_owned(),
            Self::LBracket => "`[`".to_owned(),
            Self::RBracket => "`]`".to_owned(),
            Self::LBrace => "`{`".to_owned(),
            Self::RBrace => "`}`".to_owned(),
            Self::Spread => "`...`".to_owned(),
            Self::Minus => "`-`".to_owned(),
            Self::Not => "`!`".to_owned(),
            Self::And => "`&&`".to_owned(),
            Self::Or => "`||`".to_owned(),
            Self::Compare(op) => format!("operator `{}`", op.symbol()),
        }
    }
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    index: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self { source, chars: source.char_indices().collect(), index: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).map(|(_, ch)| *ch)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.index + ahead).map(|(_, ch)| *ch)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.index).map(|(offset, _)| *offset).unwrap_or(self.source.len())
    }

    fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek() {
            let offset = self.offset();
            if ch.is_whitespace() {
                self.index += 1;
                continue;
            }

            let kind = match ch {
                '0'..='9' => self.number(offset)?,
                '"' | '\'' => self.string(ch, offset)?,
                '/' => self.regex(offset)?,
                c if c.is_ascii_alphabetic() || c == '_' || c == '$' => self.word(offset)?,
                _ => self.punctuation(ch, offset)?,
            };
            tokens.push(Token { kind, offset });
        }

        Ok(tokens)
    }

    fn number(&mut self, offset: usize) -> Result<TokenKind, CompileError> {
        let start = self.index;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.' || c == '_') {
            self.index += 1;
        }
        let literal: String =
            self.chars[start..self.index].iter().map(|(_, c)| *c).filter(|c| *c != '_').collect();
        literal
            .parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| CompileError::InvalidNumber { literal, offset })
    }

    fn string(&mut self, quote: char, offset: usize) -> Result<TokenKind, CompileError> {
        self.index += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(CompileError::UnterminatedString(offset)),
                Some(c) if c == quote => {
                    self.index += 1;
                    return Ok(TokenKind::Str(value));
                }
                Some('\\') => {
                    self.index += 1;
                    let escaped = self.peek().ok_or(CompileError::UnterminatedString(offset))?;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                    self.index += 1;
                }
                Some(c) => {
                    value.push(c);
                    self.index += 1;
                }
            }
        }
    }

    fn regex(&mut self, offset: usize) -> Result<TokenKind, CompileError> {
        self.index += 1;
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.peek() {
                None => return Err(CompileError::UnterminatedRegex(offset)),
                Some('\\') => {
                    pattern.push('\\');
                    self.index += 1;
                    let escaped = self.peek().ok_or(CompileError::UnterminatedRegex(offset))?;
                    pattern.push(escaped);
                    self.index += 1;
                }
                Some('/') if !in_class => {
                    self.index += 1;
                    break;
                }
                Some(c) => {
                    if c == '[' {
                        in_class = true;
                    } else if c == ']' {
                        in_class = false;
                    }
                    pattern.push(c);
                    self.index += 1;
                }
            }
        }

        let mut flags = String::new();
        while let Some(flag) = self.peek().filter(|c| c.is_ascii_alphabetic()) {
            if !matches!(flag, 'i' | 'm' | 's' | 'g') {
                return Err(CompileError::UnsupportedRegexFlag { flag, offset: self.offset() });
            }
            flags.push(flag);
            self.index += 1;
        }

        Ok(TokenKind::Regex { pattern, flags })
    }

    fn word(&mut self, offset: usize) -> Result<TokenKind, CompileError> {
        let start = self.index;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            self.index += 1;
        }
        let word: String = self.chars[start..self.index].iter().map(|(_, c)| *c).collect();

        if FORBIDDEN_IDENTIFIERS.contains(&word.as_str()) {
            return Err(CompileError::Forbidden { name: word, offset });
        }

        Ok(match word.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" | "undefined" => TokenKind::Null,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            _ => TokenKind::Ident(word),
        })
    }

    fn punctuation(&mut self, ch: char, offset: usize) -> Result<TokenKind, CompileError> {
        let next = self.peek_at(1);
        let (kind, width) = match (ch, next) {
            ('.', Some('.')) if self.peek_at(2) == Some('.') => (TokenKind::Spread, 3),
            ('.', _) => (TokenKind::Dot, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('?', _) => (TokenKind::Question, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('&', Some('&')) => (TokenKind::And, 2),
            ('|', Some('|')) => (TokenKind::Or, 2),
            ('=', Some('=')) => (TokenKind::Compare(CompareOp::Eq), self.equality_width()),
            ('!', Some('=')) => (TokenKind::Compare(CompareOp::Ne), self.equality_width()),
            ('!', _) => (TokenKind::Not, 1),
            ('<', Some('=')) => (TokenKind::Compare(CompareOp::Le), 2),
            ('<', _) => (TokenKind::Compare(CompareOp::Lt), 1),
            ('>', Some('=')) => (TokenKind::Compare(CompareOp::Ge), 2),
            ('>', _) => (TokenKind::Compare(CompareOp::Gt), 1),
            _ => return Err(CompileError::UnexpectedChar { ch, offset }),
        };
        self.index += width;
        Ok(kind)
    }

    /// `==`/`!=` and their strict forms `===`/`!==` share one meaning.
    fn equality_width(&self) -> usize {
        if self.peek_at(2) == Some('=') {
            3
        } else {
            2
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|token| &token.kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<(), CompileError> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(CompileError::UnexpectedToken {
                found: token.kind.describe(),
                expected,
                offset: token.offset,
            }),
            None => Err(CompileError::UnexpectedEnd(expected)),
        }
    }

    /// One more level of nesting in the tree being built.
    fn nest(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::TooDeep);
        }
        Ok(())
    }

    fn parse_expression(&mut self) -> Result<Node, CompileError> {
        self.nest()?;
        let node = self.parse_conditional();
        self.depth -= 1;
        node
    }

    fn parse_conditional(&mut self) -> Result<Node, CompileError> {
        let condition = self.parse_or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(condition);
        }
        let when_true = self.parse_expression()?;
        self.expect(TokenKind::Colon, "`:` in conditional expression")?;
        let when_false = self.parse_expression()?;
        Ok(Node::Conditional(Box::new(condition), Box::new(when_true), Box::new(when_false)))
    }

    // Chains are left-deep, so every link counts towards the depth limit.
    fn parse_or(&mut self) -> Result<Node, CompileError> {
        let entry = self.depth;
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            self.nest()?;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, CompileError> {
        let entry = self.depth;
        let mut left = self.parse_comparison()?;
        while self.eat(&TokenKind::And) {
            self.nest()?;
            let right = self.parse_comparison()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Node, CompileError> {
        let left = self.parse_unary()?;
        let Some(TokenKind::Compare(op)) = self.peek_kind().cloned() else {
            return Ok(left);
        };
        self.position += 1;
        let right = self.parse_unary()?;
        Ok(Node::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Node, CompileError> {
        if self.eat(&TokenKind::Not) {
            self.nest()?;
            let operand = self.parse_unary();
            self.depth -= 1;
            return Ok(Node::Not(Box::new(operand?)));
        }
        if self.eat(&TokenKind::Minus) {
            let operand = self.parse_postfix()?;
            return Ok(match operand {
                Node::Literal(Value::Number(number)) => {
                    Node::Literal(number_value(-number.as_f64().unwrap_or_default()))
                }
                other => Node::Negate(Box::new(other)),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, CompileError> {
        let entry = self.depth;
        let mut node = self.parse_primary()?;

        loop {
            if matches!(self.peek_kind(), Some(TokenKind::Dot | TokenKind::LBracket)) {
                self.nest()?;
            }
            if self.eat(&TokenKind::Dot) {
                let token = self.advance().ok_or(CompileError::UnexpectedEnd("property name"))?;
                let TokenKind::Ident(name) = token.kind else {
                    return Err(CompileError::UnexpectedToken {
                        found: token.kind.describe(),
                        expected: "property name",
                        offset: token.offset,
                    });
                };

                if self.peek_kind() == Some(&TokenKind::LParen) {
                    node = self.parse_method(node, name, token.offset)?;
                } else {
                    node = Node::Member(Box::new(node), name);
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expression()?;
                if let Node::Literal(Value::String(key)) = &index {
                    if FORBIDDEN_IDENTIFIERS.contains(&key.as_str()) {
                        return Err(CompileError::Forbidden {
                            name: key.clone(),
                            offset: self.previous_offset(),
                        });
                    }
                }
                self.expect(TokenKind::RBracket, "`]`")?;
                node = Node::Index(Box::new(node), Box::new(index));
            } else {
                self.depth = entry;
                return Ok(node);
            }
        }
    }

    fn previous_offset(&self) -> usize {
        self.position.checked_sub(1).and_then(|i| self.tokens.get(i)).map_or(0, |t| t.offset)
    }

    fn parse_method(
        &mut self,
        receiver: Node,
        name: String,
        offset: usize,
    ) -> Result<Node, CompileError> {
        self.expect(TokenKind::LParen, "`(`")?;

        if name == "match" {
            let regex = self.parse_regex_argument()?;
            self.expect(TokenKind::RParen, "`)` after match pattern")?;
            return Ok(Node::Matches(Box::new(receiver), regex));
        }

        let args = self.parse_list(TokenKind::RParen, "`)` after arguments")?;
        let arity = |expected: usize| -> Result<(), CompileError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(CompileError::Arity { name: name.clone(), expected, found: args.len() })
            }
        };

        match name.as_str() {
            "includes" => {
                arity(1)?;
                let needle =
                    args.into_iter().next().ok_or(CompileError::UnexpectedEnd("argument"))?;
                Ok(Node::Includes(Box::new(receiver), Box::new(needle)))
            }
            "startsWith" | "endsWith" => {
                arity(1)?;
                let method = if name == "startsWith" {
                    StringMethod::StartsWith
                } else {
                    StringMethod::EndsWith
                };
                Ok(Node::StringCall(Box::new(receiver), method, args))
            }
            "toLowerCase" | "toUpperCase" => {
                arity(0)?;
                let method = if name == "toLowerCase" {
                    StringMethod::ToLowerCase
                } else {
                    StringMethod::ToUpperCase
                };
                Ok(Node::StringCall(Box::new(receiver), method, args))
            }
            _ => Err(CompileError::UnsupportedMethod { name, offset }),
        }
    }

    fn parse_regex_argument(&mut self) -> Result<Arc<Regex>, CompileError> {
        let token = self.advance().ok_or(CompileError::UnexpectedEnd("regex pattern"))?;
        match token.kind {
            TokenKind::Regex { pattern, flags } => build_regex(&pattern, &flags),
            TokenKind::Str(pattern) => build_regex(&pattern, ""),
            other => Err(CompileError::UnexpectedToken {
                found: other.describe(),
                expected: "regex or string literal",
                offset: token.offset,
            }),
        }
    }

    fn parse_list(
        &mut self,
        close: TokenKind,
        expected: &'static str,
    ) -> Result<Vec<Node>, CompileError> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expression()?);
            if self.eat(&close) {
                return Ok(items);
            }
            self.expect(TokenKind::Comma, expected)?;
            if self.eat(&close) {
                return Ok(items);
            }
        }
    }

    fn parse_object(&mut self) -> Result<Node, CompileError> {
        let mut entries = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace) {
                return Ok(Node::Object(entries));
            }

            if self.eat(&TokenKind::Spread) {
                entries.push(ObjectEntry::Spread(self.parse_expression()?));
            } else {
                let token = self.advance().ok_or(CompileError::UnexpectedEnd("object key"))?;
                let key = match token.kind {
                    TokenKind::Ident(name) | TokenKind::Str(name) => name,
                    other => {
                        return Err(CompileError::UnexpectedToken {
                            found: other.describe(),
                            expected: "object key",
                            offset: token.offset,
                        })
                    }
                };
                if FORBIDDEN_IDENTIFIERS.contains(&key.as_str()) {
                    return Err(CompileError::Forbidden { name: key, offset: token.offset });
                }
                self.expect(TokenKind::Colon, "`:` after object key")?;
                entries.push(ObjectEntry::Field(key, self.parse_expression()?));
            }

            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RBrace, "`,` or `}` in object literal")?;
                return Ok(Node::Object(entries));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Node, CompileError> {
        let token = self.advance().ok_or(CompileError::UnexpectedEnd("a value"))?;
        match token.kind {
            TokenKind::Number(value) => Ok(Node::Literal(number_value(value))),
            TokenKind::Str(value) => Ok(Node::Literal(Value::String(value))),
            TokenKind::True => Ok(Node::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Node::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Node::Literal(Value::Null)),
            TokenKind::Ident(name) => match name.as_str() {
                "tool" => Ok(Node::Root(Root::Tool)),
                "context" => Ok(Node::Root(Root::Context)),
                "args" => Ok(Node::Root(Root::Args)),
                _ => Err(CompileError::UnknownIdentifier { name, offset: token.offset }),
            },
            TokenKind::Regex { pattern, flags } => {
                let regex = build_regex(&pattern, &flags)?;
                let is_test = self.peek_kind() == Some(&TokenKind::Dot)
                    && matches!(
                        self.tokens.get(self.position + 1).map(|t| &t.kind),
                        Some(TokenKind::Ident(name)) if name == "test"
                    );
                if !is_test {
                    return Err(CompileError::DetachedRegex(token.offset));
                }
                self.position += 2;
                self.expect(TokenKind::LParen, "`(` after test")?;
                let subject = self.parse_expression()?;
                self.expect(TokenKind::RParen, "`)` after test argument")?;
                Ok(Node::Matches(Box::new(subject), regex))
            }
            TokenKind::LParen => {
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                Ok(Node::Array(self.parse_list(TokenKind::RBracket, "`,` or `]` in array")?))
            }
            TokenKind::LBrace => self.parse_object(),
            other => Err(CompileError::UnexpectedToken {
                found: other.describe(),
                expected: "a value",
                offset: token.offset,
            }),
        }
    }
}

fn build_regex(pattern: &str, flags: &str) -> Result<Arc<Regex>, CompileError> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map(Arc::new)
        .map_err(|error| CompileError::InvalidRegex {
            pattern: pattern.to_owned(),
            message: error.to_string(),
        })
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0 && !n.is_nan()).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn evaluate(node: &Node, bindings: &Bindings<'_>) -> Result<Value, EvalError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Root(Root::Tool) => Ok(bindings.tool.clone()),
        Node::Root(Root::Context) => Ok(bindings.context.clone()),
        Node::Root(Root::Args) => Ok(bindings.args.clone()),
        Node::Member(object, property) => {
            let object = evaluate(object, bindings)?;
            read_member(&object, property)
        }
        Node::Index(object, index) => {
            let object = evaluate(object, bindings)?;
            let index = evaluate(index, bindings)?;
            match (&object, &index) {
                (Value::Null, _) => {
                    Err(EvalError::NullProperty { property: index.to_string() })
                }
                (Value::Array(items), Value::Number(position)) => Ok(position
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null)),
                (_, Value::String(key)) => read_member(&object, key),
                _ => Ok(Value::Null),
            }
        }
        Node::Matches(subject, regex) => match evaluate(subject, bindings)? {
            Value::String(text) => Ok(Value::Bool(regex.is_match(&text))),
            Value::Null => Err(EvalError::NullProperty { property: "match".to_owned() }),
            other => Err(EvalError::BadReceiver {
                method: "match",
                expected: "string",
                found: type_name(&other),
            }),
        },
        Node::Includes(receiver, needle) => {
            let receiver = evaluate(receiver, bindings)?;
            let needle = evaluate(needle, bindings)?;
            match (&receiver, &needle) {
                (Value::Array(items), _) => {
                    Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
                }
                (Value::String(text), Value::String(part)) => {
                    Ok(Value::Bool(text.contains(part.as_str())))
                }
                (Value::String(_), other) => Err(EvalError::BadArgument {
                    method: "includes",
                    expected: "string",
                    found: type_name(other),
                }),
                (Value::Null, _) => {
                    Err(EvalError::NullProperty { property: "includes".to_owned() })
                }
                (other, _) => Err(EvalError::BadReceiver {
                    method: "includes",
                    expected: "string or array",
                    found: type_name(other),
                }),
            }
        }
        Node::StringCall(receiver, method, args) => {
            let name = match method {
                StringMethod::StartsWith => "startsWith",
                StringMethod::EndsWith => "endsWith",
                StringMethod::ToLowerCase => "toLowerCase",
                StringMethod::ToUpperCase => "toUpperCase",
            };
            let text = match evaluate(receiver, bindings)? {
                Value::String(text) => text,
                Value::Null => return Err(EvalError::NullProperty { property: name.to_owned() }),
                other => {
                    return Err(EvalError::BadReceiver {
                        method: name,
                        expected: "string",
                        found: type_name(&other),
                    })
                }
            };
            match method {
                StringMethod::ToLowerCase => Ok(Value::String(text.to_lowercase())),
                StringMethod::ToUpperCase => Ok(Value::String(text.to_uppercase())),
                StringMethod::StartsWith | StringMethod::EndsWith => {
                    let argument = match args.first() {
                        Some(arg) => evaluate(arg, bindings)?,
                        None => Value::Null,
                    };
                    let Value::String(part) = argument else {
                        return Err(EvalError::BadArgument {
                            method: name,
                            expected: "string",
                            found: type_name(&argument),
                        });
                    };
                    Ok(Value::Bool(if *method == StringMethod::StartsWith {
                        text.starts_with(part.as_str())
                    } else {
                        text.ends_with(part.as_str())
                    }))
                }
            }
        }
        Node::Not(operand) => Ok(Value::Bool(!truthy(&evaluate(operand, bindings)?))),
        Node::Negate(operand) => match evaluate(operand, bindings)? {
            Value::Number(number) => Ok(number_value(-number.as_f64().unwrap_or_default())),
            other => Err(EvalError::BadNegation(type_name(&other))),
        },
        Node::And(left, right) => {
            let left = evaluate(left, bindings)?;
            if truthy(&left) {
                evaluate(right, bindings)
            } else {
                Ok(left)
            }
        }
        Node::Or(left, right) => {
            let left = evaluate(left, bindings)?;
            if truthy(&left) {
                Ok(left)
            } else {
                evaluate(right, bindings)
            }
        }
        Node::Compare(op, left, right) => {
            let left = evaluate(left, bindings)?;
            let right = evaluate(right, bindings)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Node::Conditional(condition, when_true, when_false) => {
            if truthy(&evaluate(condition, bindings)?) {
                evaluate(when_true, bindings)
            } else {
                evaluate(when_false, bindings)
            }
        }
        Node::Array(items) => items
            .iter()
            .map(|item| evaluate(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Node::Object(entries) => {
            let mut object = Map::new();
            for entry in entries {
                match entry {
                    ObjectEntry::Field(key, value) => {
                        object.insert(key.clone(), evaluate(value, bindings)?);
                    }
                    ObjectEntry::Spread(source) => match evaluate(source, bindings)? {
                        Value::Object(fields) => object.extend(fields),
                        Value::Null => {}
                        other => return Err(EvalError::BadSpread(type_name(&other))),
                    },
                }
            }
            Ok(Value::Object(object))
        }
    }
}

fn read_member(object: &Value, property: &str) -> Result<Value, EvalError> {
    match object {
        Value::Null => Err(EvalError::NullProperty { property: property.to_owned() }),
        Value::Object(fields) => Ok(fields.get(property).cloned().unwrap_or(Value::Null)),
        Value::String(text) if property == "length" => Ok(Value::from(text.chars().count())),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        _ => Ok(Value::Null),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => return Ok(values_equal(left, right)),
        CompareOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }

    // Missing values order against nothing.
    if left.is_null() || right.is_null() {
        return Ok(false);
    }

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(EvalError::Incomparable { left: type_name(left), right: type_name(right) });
    };

    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq | CompareOp::Ne => false,
    })
}
