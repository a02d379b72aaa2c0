//! The sentinel protocol.
//!
//! A job reports a named scalar by printing a line of the form
//! `HDF5:{'name': 'x', 'value': 3.5, 'desc': ''}:5FDH`. The payload between the
//! markers is a Python literal dict and may wrap onto several lines. The same
//! marker doubles as the durable "this job finished" signal in stderr files.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Opening marker. A line starting with this carries a record.
pub const OPEN: &str = "HDF5:";
/// Closing marker.
pub const CLOSE: &str = ":5FDH";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SentinelError {
    #[error("record opened with '{OPEN}' is never closed with '{CLOSE}'")]
    Unterminated,
    #[error("payload ended unexpectedly")]
    UnexpectedEnd,
    #[error("unexpected '{found}' at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("invalid number '{0}'")]
    BadNumber(String),
    #[error("payload is missing the '{0}' key")]
    MissingKey(&'static str),
}

/// A literal value carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

/// Writes the value back out as a Python literal.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", float_literal(*x)),
            Value::Str(s) => write!(f, "{}", str_literal(s)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

fn float_literal(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

fn str_literal(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// One named result carried by a sentinel line.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub value: Value,
    pub desc: String,
}

impl Record {
    pub fn new(name: impl Into<String>, value: impl Into<Value>, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            desc: desc.into(),
        }
    }

    /// The elapsed-time record appended to a job's stderr on completion.
    pub fn time(seconds: f64) -> Self {
        Self::new("time", seconds, "")
    }

    /// Renders the full sentinel line, without a trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{}{{'name': {}, 'value': {}, 'desc': {}}}{}",
            OPEN,
            str_literal(&self.name),
            self.value,
            str_literal(&self.desc),
            CLOSE
        )
    }

    /// Parses the payload between the markers.
    pub fn parse_payload(payload: &str) -> Result<Self, SentinelError> {
        let mut parser = Parser::new(payload);
        let entries = parser.dict()?;
        parser.end()?;

        let mut name = None;
        let mut value = None;
        let mut desc = None;
        for (key, v) in entries {
            match key.as_str() {
                "name" => name = Some(v),
                "value" => value = Some(v),
                "desc" => desc = Some(v),
                _ => {}
            }
        }
        let name = match name.ok_or(SentinelError::MissingKey("name"))? {
            Value::Str(s) => s,
            other => other.to_string(),
        };
        let value = value.ok_or(SentinelError::MissingKey("value"))?;
        let desc = match desc {
            Some(Value::Str(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Ok(Self { name, value, desc })
    }
}

/// Returns true if any line of `text` opens a sentinel record.
pub fn has_marker(text: &str) -> bool {
    text.lines().any(|line| line.starts_with(OPEN))
}

/// Collects the raw payloads of every record in `text`, joining wrapped lines.
pub fn payloads(text: &str) -> Vec<Result<String, SentinelError>> {
    let mut found = vec![];
    let mut open: Option<String> = None;
    for line in text.lines() {
        if let Some(mut buf) = open.take() {
            buf.push('\n');
            match line.strip_suffix(CLOSE) {
                Some(body) => {
                    buf.push_str(body);
                    found.push(Ok(buf));
                }
                None => {
                    buf.push_str(line);
                    open = Some(buf);
                }
            }
        } else if let Some(rest) = line.strip_prefix(OPEN) {
            match rest.strip_suffix(CLOSE) {
                Some(body) => found.push(Ok(body.to_string())),
                None => open = Some(rest.to_string()),
            }
        }
    }
    if open.is_some() {
        found.push(Err(SentinelError::Unterminated));
    }
    found
}

/// Parses every well-formed record in `text`. Malformed ones are logged and skipped.
pub fn records(text: &str) -> Vec<Record> {
    payloads(text)
        .into_iter()
        .filter_map(|payload| match payload.and_then(|p| Record::parse_payload(&p)) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping malformed sentinel record");
                None
            }
        })
        .collect()
}

/// Appends `record` as its own line to the file at `path`, creating the file if needed.
pub fn append(path: &Path, record: &Record) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    let mut needs_newline = false;
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        needs_newline = last[0] != b'\n';
    }
    if needs_newline {
        writeln!(file)?;
    }
    writeln!(file, "{}", record.to_line())
}

/// Recursive descent over the subset of Python literals jobs emit.
struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn unexpected(&self) -> SentinelError {
        match self.peek() {
            Some(found) => SentinelError::Unexpected {
                found,
                offset: self.pos,
            },
            None => SentinelError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, want: char) -> Result<(), SentinelError> {
        self.skip_ws();
        if self.peek() == Some(want) {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn end(&mut self) -> Result<(), SentinelError> {
        self.skip_ws();
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.unexpected()),
        }
    }

    fn dict(&mut self) -> Result<Vec<(String, Value)>, SentinelError> {
        self.expect('{')?;
        let mut entries = vec![];
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(entries);
            }
            let key = match self.peek() {
                Some('\'') | Some('"') => self.string()?,
                _ => return Err(self.unexpected()),
            };
            self.expect(':')?;
            let value = self.value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(entries),
                Some(found) => {
                    return Err(SentinelError::Unexpected {
                        found,
                        offset: self.pos - found.len_utf8(),
                    })
                }
                None => return Err(SentinelError::UnexpectedEnd),
            }
        }
    }

    fn value(&mut self) -> Result<Value, SentinelError> {
        self.skip_ws();
        match self.peek() {
            Some('\'') | Some('"') => Ok(Value::Str(self.string()?)),
            Some('[') => self.sequence('[', ']'),
            Some('(') => self.sequence('(', ')'),
            Some(c) if c.is_ascii_alphabetic() => self.word(),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.number(),
            _ => Err(self.unexpected()),
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Result<Value, SentinelError> {
        self.expect(open)?;
        let mut items = vec![];
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {}
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn word(&mut self) -> Result<Value, SentinelError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "None" => Ok(Value::None),
            "nan" => Ok(Value::Float(f64::NAN)),
            "inf" => Ok(Value::Float(f64::INFINITY)),
            _ => {
                self.pos = start;
                Err(self.unexpected())
            }
        }
    }

    fn number(&mut self) -> Result<Value, SentinelError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || "+-.".contains(c)) {
            self.bump();
        }
        let text = &self.src[start..self.pos];
        let is_float = text.contains(['.', 'e', 'E', 'n', 'i']);
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::Int(i));
            }
        }
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| SentinelError::BadNumber(text.to_string()))
    }

    fn string(&mut self) -> Result<String, SentinelError> {
        let quote = self.bump().ok_or(SentinelError::UnexpectedEnd)?;
        let mut out = String::new();
        loop {
            match self.bump().ok_or(SentinelError::UnexpectedEnd)? {
                '\\' => match self.bump().ok_or(SentinelError::UnexpectedEnd)? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                },
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
    }
}
