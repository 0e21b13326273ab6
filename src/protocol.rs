use crate::error::{Result, TesiraError};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Instance tag used to address the device itself
pub const DEVICE_TAG: &str = "DEVICE";

/// Instance tag used to address the TTP session
pub const SESSION_TAG: &str = "SESSION";

/// Addressee of a command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// DSP block addressed by its instance tag
    Block(String),
    /// The device (`DEVICE`)
    Device,
    /// The TTP session (`SESSION`)
    Session,
}

impl Target {
    /// Target a block by instance tag
    pub fn block(id: impl Into<String>) -> Self {
        Self::Block(id.into())
    }
}

/// Command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Set,
    Subscribe,
    Unsubscribe,
    /// Service call with no verb keyword, e.g. `DEVICE reboot`
    Invoke,
}

impl Verb {
    fn keyword(self) -> Option<&'static str> {
        match self {
            Verb::Get => Some("get"),
            Verb::Set => Some("set"),
            Verb::Subscribe => Some("subscribe"),
            Verb::Unsubscribe => Some("unsubscribe"),
            Verb::Invoke => None,
        }
    }
}

/// A single command argument
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Channel, source or band index (1-based on the device)
    Index(u32),
    /// Real value, sent with six decimal places
    Number(f64),
    Bool(bool),
    /// Quoted string
    Text(String),
    /// Bare word, e.g. a publish token
    Word(String),
}

impl From<u32> for Argument {
    fn from(value: u32) -> Self {
        Argument::Index(value)
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Number(value)
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Bool(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Text(value.to_string())
    }
}

impl Argument {
    fn encode_into(&self, line: &mut String) {
        match self {
            Argument::Index(i) => line.push_str(&i.to_string()),
            Argument::Number(v) => line.push_str(&format_number(*v)),
            Argument::Bool(b) => line.push_str(if *b { "true" } else { "false" }),
            Argument::Text(s) => line.push_str(&quote(s)),
            Argument::Word(w) => line.push_str(w),
        }
    }
}

/// A TTP command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: Target,
    pub verb: Verb,
    pub attribute: String,
    pub args: Vec<Argument>,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(target: Target, verb: Verb, attribute: impl Into<String>) -> Self {
        Self {
            target,
            verb,
            attribute: attribute.into(),
            args: Vec::new(),
        }
    }

    pub fn get(target: Target, attribute: impl Into<String>) -> Self {
        Self::new(target, Verb::Get, attribute)
    }

    pub fn set(target: Target, attribute: impl Into<String>) -> Self {
        Self::new(target, Verb::Set, attribute)
    }

    pub fn subscribe(target: Target, attribute: impl Into<String>) -> Self {
        Self::new(target, Verb::Subscribe, attribute)
    }

    pub fn unsubscribe(target: Target, attribute: impl Into<String>) -> Self {
        Self::new(target, Verb::Unsubscribe, attribute)
    }

    /// Service call, e.g. `DEVICE startAudio`
    pub fn invoke(target: Target, service: impl Into<String>) -> Self {
        Self::new(target, Verb::Invoke, service)
    }

    /// Append an index argument
    pub fn with_index(self, index: u32) -> Self {
        self.with_arg(Argument::Index(index))
    }

    /// Append an optional index argument
    pub fn with_optional_index(self, index: Option<u32>) -> Self {
        match index {
            Some(i) => self.with_index(i),
            None => self,
        }
    }

    /// Append an argument
    pub fn with_arg(mut self, arg: impl Into<Argument>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Encode the command into a single protocol line (without terminator)
    pub fn encode(&self) -> String {
        let mut line = match &self.target {
            Target::Block(id) => quote(id),
            Target::Device => DEVICE_TAG.to_string(),
            Target::Session => SESSION_TAG.to_string(),
        };
        if let Some(keyword) = self.verb.keyword() {
            line.push(' ');
            line.push_str(keyword);
        }
        line.push(' ');
        line.push_str(&self.attribute);
        for arg in &self.args {
            line.push(' ');
            arg.encode_into(&mut line);
        }
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A decoded line received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`, with the returned value (`Null` for bare acknowledgements)
    Success(Value),
    /// `-ERR ...`, `-CANNOT_DELIVER`, `-GENERAL_FAILURE`
    Error { code: String, message: String },
    /// `! "publishToken":... "value":...`
    Publish { token: String, value: Value },
}

impl Reply {
    /// Decode one line
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim();

        if let Some(body) = line.strip_prefix("+OK") {
            if body.is_empty() || body.starts_with(char::is_whitespace) {
                return Ok(Reply::Success(parse_body(body)?));
            }
        }

        if let Some(rest) = line.strip_prefix('-') {
            let (code, message) = match rest.split_once(char::is_whitespace) {
                Some((code, message)) => (code, message.trim()),
                None => (rest, ""),
            };
            if !code.is_empty() && code.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                return Ok(Reply::Error {
                    code: code.to_string(),
                    message: message.to_string(),
                });
            }
        }

        if let Some(body) = line.strip_prefix('!') {
            let mut fields = ValueParser::new(body).parse_fields(None)?;
            let token = match fields.remove("publishToken") {
                Some(Value::String(token)) => token,
                _ => return Err(TesiraError::protocol(format!("publish without token: {line}"))),
            };
            let value = fields.remove("value").unwrap_or(Value::Null);
            return Ok(Reply::Publish { token, value });
        }

        Err(TesiraError::protocol(format!("unrecognised line: {line}")))
    }

    /// Check if the reply is a success or error (i.e. answers a command)
    pub fn is_response(&self) -> bool {
        !matches!(self, Reply::Publish { .. })
    }
}

/// Parse the body of a `+OK` reply
fn parse_body(body: &str) -> Result<Value> {
    let mut parser = ValueParser::new(body);
    if parser.is_done() {
        return Ok(Value::Null);
    }

    if parser.starts_with_field() {
        let fields = parser.parse_fields(None)?;
        if fields.len() == 1 {
            return Ok(fields.into_iter().next().map(|(_, v)| v).unwrap_or_default());
        }
        return Ok(Value::Object(fields));
    }

    let value = parser.parse_value()?;
    if !parser.is_done() {
        return Err(TesiraError::protocol(format!("trailing data in reply: {body}")));
    }
    Ok(value)
}

/// Recursive-descent parser for the TTP value grammar
struct ValueParser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> ValueParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn is_done(&mut self) -> bool {
        self.skip_whitespace();
        self.chars.peek().is_none()
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(TesiraError::protocol(format!("expected '{expected}', found '{c}'"))),
            None => Err(TesiraError::protocol(format!("expected '{expected}', found end of line"))),
        }
    }

    /// Look ahead for a `"key":` prefix without consuming anything
    fn starts_with_field(&self) -> bool {
        let mut ahead = ValueParser {
            chars: self.chars.clone(),
        };
        ahead.skip_whitespace();
        ahead.chars.peek() == Some(&'"')
            && ahead.parse_string().is_ok()
            && ahead.chars.peek() == Some(&':')
    }

    /// Parse `"key":value` pairs until `terminator` (or end of line when `None`)
    fn parse_fields(&mut self, terminator: Option<char>) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        loop {
            self.skip_whitespace();
            match (self.chars.peek(), terminator) {
                (None, None) => break,
                (None, Some(t)) => return Err(TesiraError::protocol(format!("missing '{t}'"))),
                (Some(&c), Some(t)) if c == t => {
                    self.chars.next();
                    break;
                }
                _ => {}
            }
            let key = self.parse_string()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            fields.insert(key, value);
        }
        Ok(fields)
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('"') => self.parse_string().map(Value::String),
            Some('[') => {
                self.chars.next();
                self.parse_array()
            }
            Some('{') => {
                self.chars.next();
                self.parse_fields(Some('}')).map(Value::Object)
            }
            Some(_) => self.parse_word().map(scalar),
            None => Err(TesiraError::protocol("unexpected end of line")),
        }
    }

    fn parse_array(&mut self) -> Result<Value> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some(']') => {
                    self.chars.next();
                    return Ok(Value::Array(items));
                }
                None => return Err(TesiraError::protocol("missing ']'")),
                _ => items.push(self.parse_value()?),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some(c) => out.push(c),
                    None => return Err(TesiraError::protocol("unterminated string")),
                },
                Some(c) => out.push(c),
                None => return Err(TesiraError::protocol("unterminated string")),
            }
        }
    }

    fn parse_word(&mut self) -> Result<String> {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '[' | ']' | '{' | '}' | '"') {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        if word.is_empty() {
            let found = self.chars.peek().copied().unwrap_or(' ');
            return Err(TesiraError::protocol(format!("unexpected '{found}'")));
        }
        Ok(word)
    }
}

/// Interpret a bare word: booleans, numbers, or an enum-like string
fn scalar(word: String) -> Value {
    match word.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = word.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = word.parse::<f64>() {
                Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::String(word))
            } else {
                Value::String(word)
            }
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn format_number(value: f64) -> String {
    format!("{value:.6}")
}

// ========== Typed value extraction ==========

/// Read a reply value as a real number
pub fn value_as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| TesiraError::protocol(format!("expected number, got {value}")))
}

/// Read a reply value as a boolean
pub fn value_as_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
    .ok_or_else(|| TesiraError::protocol(format!("expected boolean, got {value}")))
}

/// Read a reply value as a non-negative integer
pub fn value_as_u32(value: &Value) -> Result<u32> {
    let f = value_as_f64(value)?;
    if f.fract() != 0.0 || f < 0.0 || f > f64::from(u32::MAX) {
        return Err(TesiraError::protocol(format!("expected count, got {value}")));
    }
    Ok(f as u32)
}

/// Read a reply value as text
pub fn value_as_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(TesiraError::protocol(format!("expected text, got {value}"))),
    }
}

/// Read a reply value as a list
pub fn value_as_list(value: &Value) -> Result<&[Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| TesiraError::protocol(format!("expected list, got {value}")))
}
