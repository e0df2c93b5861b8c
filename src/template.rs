//! Command template rendering.
//!
//! Install and execute commands are configured as templates in the
//! `text/template` style used by Packer (`{{.StagingDir}}`,
//! `{{if .Sudo}}sudo -E {{end}}`, ...). This module implements the subset
//! those templates need:
//!
//! - text with `{{ action }}` blocks, `{{-` / `-}}` trimming adjacent whitespace
//! - field references (`.Name`) resolved through a [`TemplateData`] record
//! - string (`"..."`, `` `...` ``) and boolean literals
//! - functions `eq`, `ne`, `not`, `and`, `or` and `printf`
//! - `if` / `else` / `else if` / `end` control blocks
//!
//! Templates are parsed once into a small tree and rendered against a data
//! record; rendering the same template with the same data is deterministic.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\.([A-Za-z_][A-Za-z0-9_]*)$").expect("field reference regex")
});

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Error raised while parsing or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TemplateError(String);

impl TemplateError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A value produced by a field lookup or an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    /// Returns the truth value used by `if`, `not`, `and` and `or`.
    ///
    /// Strings are true when non-empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Bool(b) => *b,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A record whose fields can be referenced from a template.
pub trait TemplateData {
    /// Returns the value of the named field, or `None` if the record has no such field.
    fn field(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Eq,
    Ne,
    Not,
    And,
    Or,
    Printf,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "not" => Some(Self::Not),
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "printf" => Some(Self::Printf),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Not => "not",
            Self::And => "and",
            Self::Or => "or",
            Self::Printf => "printf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Field(String),
    Literal(Value),
    Call { func: Func, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Action(Expr),
    If {
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Field(String),
    Str(String),
    Bool(bool),
}

enum Segment<'a> {
    Text(String),
    Action(&'a str),
}

/// An open `if` block while parsing.
struct Frame {
    cond: Expr,
    then: Vec<Node>,
    otherwise: Option<Vec<Node>>,
    /// Opened by `else if`; closed together with its parent by a single `end`.
    chained: bool,
}

impl Frame {
    fn new(cond: Expr, chained: bool) -> Self {
        Self {
            cond,
            then: Vec::new(),
            otherwise: None,
            chained,
        }
    }

    fn branch_mut(&mut self) -> &mut Vec<Node> {
        match self.otherwise {
            Some(ref mut nodes) => nodes,
            None => &mut self.then,
        }
    }

    fn into_node(self) -> Node {
        Node::If {
            cond: self.cond,
            then: self.then,
            otherwise: self.otherwise.unwrap_or_default(),
        }
    }
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parses template source text.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut root = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        for segment in split_segments(source)? {
            let action = match segment {
                Segment::Text(text) => {
                    push_node(&mut root, &mut stack, Node::Text(text));
                    continue;
                }
                Segment::Action(action) => action,
            };

            let tokens = tokenize(action)?;
            match tokens.first() {
                Some(Token::Ident(keyword)) if keyword == "if" => {
                    let cond = parse_expr(&tokens[1..])?;
                    stack.push(Frame::new(cond, false));
                }
                Some(Token::Ident(keyword)) if keyword == "else" => {
                    let frame = stack
                        .last_mut()
                        .ok_or_else(|| TemplateError::new("unexpected {{else}}"))?;
                    if frame.otherwise.is_some() {
                        return Err(TemplateError::new("unexpected {{else}} after {{else}}"));
                    }
                    frame.otherwise = Some(Vec::new());
                    match tokens.get(1) {
                        None => {}
                        Some(Token::Ident(keyword)) if keyword == "if" => {
                            let cond = parse_expr(&tokens[2..])?;
                            stack.push(Frame::new(cond, true));
                        }
                        Some(_) => {
                            return Err(TemplateError::new("unexpected token after {{else}}"));
                        }
                    }
                }
                Some(Token::Ident(keyword)) if keyword == "end" => {
                    if tokens.len() > 1 {
                        return Err(TemplateError::new("unexpected token after {{end}}"));
                    }
                    loop {
                        let frame = stack
                            .pop()
                            .ok_or_else(|| TemplateError::new("unexpected {{end}}"))?;
                        let chained = frame.chained;
                        push_node(&mut root, &mut stack, frame.into_node());
                        if !chained {
                            break;
                        }
                    }
                }
                _ => {
                    let expr = parse_expr(&tokens)?;
                    push_node(&mut root, &mut stack, Node::Action(expr));
                }
            }
        }

        if !stack.is_empty() {
            return Err(TemplateError::new("unexpected EOF: missing {{end}}"));
        }
        Ok(Self { nodes: root })
    }

    /// Renders the template against a data record.
    pub fn render(&self, data: &dyn TemplateData) -> Result<String, TemplateError> {
        let mut out = String::new();
        render_nodes(&self.nodes, data, &mut out)?;
        Ok(out)
    }
}

/// Parses and renders `source` in one step.
pub fn render(source: &str, data: &dyn TemplateData) -> Result<String, TemplateError> {
    Template::parse(source)?.render(data)
}

fn push_node(root: &mut Vec<Node>, stack: &mut [Frame], node: Node) {
    match stack.last_mut() {
        Some(frame) => frame.branch_mut().push(node),
        None => root.push(node),
    }
}

fn starts_with_trim_marker(s: &str) -> bool {
    s.strip_prefix('-')
        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

fn ends_with_trim_marker(s: &str) -> bool {
    s.strip_suffix('-')
        .is_some_and(|rest| rest.ends_with(char::is_whitespace))
}

/// Splits template source into literal text and action bodies.
fn split_segments(source: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let trim_prev = starts_with_trim_marker(after);

        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start();
        }
        if trim_prev {
            text = text.trim_end();
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }

        let end = find_action_end(after)?;
        let mut body = &after[..end];
        if trim_prev {
            body = &body[1..];
        }
        trim_next = ends_with_trim_marker(body);
        if trim_next {
            body = &body[..body.len() - 1];
        }
        segments.push(Segment::Action(body.trim()));
        rest = &after[end + 2..];
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(segments)
}

/// Finds the closing `}}` of an action, skipping over quoted strings.
fn find_action_end(s: &str) -> Result<usize, TemplateError> {
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, c) in s.char_indices() {
        match quote {
            Some('"') if escaped => escaped = false,
            Some('"') if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '`' => quote = Some(c),
            None if s[idx..].starts_with("}}") => return Ok(idx),
            None => {}
        }
    }
    Err(TemplateError::new("unclosed action"))
}

fn tokenize(action: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = action.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    None => return Err(TemplateError::new("unterminated quoted string")),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some(other) => {
                            return Err(TemplateError::new(format!(
                                "unknown escape sequence: \\{}",
                                other
                            )));
                        }
                        None => return Err(TemplateError::new("unterminated quoted string")),
                    },
                    Some(other) => value.push(other),
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if c == '`' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    None => return Err(TemplateError::new("unterminated raw quoted string")),
                    Some('`') => break,
                    Some(other) => value.push(other),
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }

        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            chars.next();
        }

        let token = match word.as_str() {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            _ => {
                if let Some(caps) = FIELD_RE.captures(&word) {
                    Token::Field(caps[1].to_string())
                } else if IDENT_RE.is_match(&word) {
                    Token::Ident(word)
                } else {
                    return Err(TemplateError::new(format!("unexpected \"{}\" in command", word)));
                }
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn parse_expr(tokens: &[Token]) -> Result<Expr, TemplateError> {
    let (first, rest) = tokens
        .split_first()
        .ok_or_else(|| TemplateError::new("missing value for command"))?;

    match first {
        Token::Ident(name) => {
            let func = match Func::lookup(name) {
                Some(func) => func,
                None if matches!(name.as_str(), "if" | "else" | "end") => {
                    return Err(TemplateError::new(format!("unexpected keyword \"{}\"", name)));
                }
                None => {
                    return Err(TemplateError::new(format!("function \"{}\" not defined", name)));
                }
            };
            let args = rest.iter().map(parse_operand).collect::<Result<Vec<_>, _>>()?;
            check_arity(func, args.len())?;
            Ok(Expr::Call { func, args })
        }
        _ if !rest.is_empty() => Err(TemplateError::new("can't give argument to non-function")),
        operand => parse_operand(operand),
    }
}

fn parse_operand(token: &Token) -> Result<Expr, TemplateError> {
    match token {
        Token::Field(name) => Ok(Expr::Field(name.clone())),
        Token::Str(s) => Ok(Expr::Literal(Value::Str(s.clone()))),
        Token::Bool(b) => Ok(Expr::Literal(Value::Bool(*b))),
        Token::Ident(name) => Err(TemplateError::new(format!(
            "unexpected \"{}\" in operand; nested calls are not supported",
            name
        ))),
    }
}

fn check_arity(func: Func, count: usize) -> Result<(), TemplateError> {
    let ok = match func {
        Func::Eq | Func::Ne => count == 2,
        Func::Not => count == 1,
        Func::And | Func::Or | Func::Printf => count >= 1,
    };
    if ok {
        Ok(())
    } else {
        Err(TemplateError::new(format!(
            "wrong number of args for {}: got {}",
            func.name(),
            count
        )))
    }
}

fn render_nodes(
    nodes: &[Node],
    data: &dyn TemplateData,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(expr) => out.push_str(&eval(expr, data)?.to_string()),
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if eval(cond, data)?.is_truthy() {
                    render_nodes(then, data, out)?;
                } else {
                    render_nodes(otherwise, data, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval(expr: &Expr, data: &dyn TemplateData) -> Result<Value, TemplateError> {
    match expr {
        Expr::Field(name) => data
            .field(name)
            .ok_or_else(|| TemplateError::new(format!("can't evaluate field {}", name))),
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|arg| eval(arg, data))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, values)
        }
    }
}

fn call(func: Func, mut values: Vec<Value>) -> Result<Value, TemplateError> {
    match func {
        Func::Eq | Func::Ne => {
            let (a, b) = (&values[0], &values[1]);
            if a.type_name() != b.type_name() {
                return Err(TemplateError::new(format!(
                    "error calling {}: incompatible types for comparison: {} and {}",
                    func.name(),
                    a.type_name(),
                    b.type_name()
                )));
            }
            let equal = a == b;
            Ok(Value::Bool(if func == Func::Eq { equal } else { !equal }))
        }
        Func::Not => Ok(Value::Bool(!values[0].is_truthy())),
        Func::And => {
            let last = values.pop().unwrap_or(Value::Bool(true));
            Ok(values.into_iter().find(|v| !v.is_truthy()).unwrap_or(last))
        }
        Func::Or => {
            let last = values.pop().unwrap_or(Value::Bool(false));
            Ok(values.into_iter().find(Value::is_truthy).unwrap_or(last))
        }
        Func::Printf => {
            let format = values.remove(0);
            Ok(Value::Str(sprintf(&format.to_string(), &values)))
        }
    }
}

/// Formats `args` according to a printf-style `format` string.
///
/// Supports the `%s`, `%v`, `%t`, `%d`, `%q` and `%%` verbs.
fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 't' | 'd' | 'q')) => match args.next() {
                Some(arg) if verb == 'q' => out.push_str(&format!("{:?}", arg.to_string())),
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str(&format!("%!{}(MISSING)", verb)),
            },
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push_str("%!(NOVERB)"),
        }
    }
    out
}
