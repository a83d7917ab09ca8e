//! Wire protocol types for host-worker communication.
//!
//! Every message is a command name plus an ordered list of argument values.
//! On the wire it travels as two frames (see [`codec`](super::codec)):
//! - **command frame**: ASCII command name
//! - **payload frame**: versioned, tagged argument encoding

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codec::CodecError;

/// Worker → host: handshake carrying the worker's inbound endpoint.
pub const READY: &str = "READY";
/// Host → worker: graceful shutdown request.
pub const QUIT: &str = "QUIT";
/// Worker → host: acknowledgment of [`QUIT`].
pub const STOPPED: &str = "STOPPED";
/// Liveness probe carrying an opaque timestamp token.
pub const PING: &str = "PING";
/// Reply to [`PING`] echoing the token.
pub const PONG: &str = "PONG";

pub const RESERVED_COMMANDS: [&str; 5] = [READY, QUIT, STOPPED, PING, PONG];

/// Longest accepted command name, in bytes.
pub const MAX_COMMAND_LEN: usize = 64;

/// A single argument value.
///
/// Covers the scalar and sequence types that both ends must round-trip exactly.
/// Floats travel as raw bits, so a NaN arrives intact but, as with `f64`,
/// never compares equal to itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of the value. Strings are parsed, so `"2"` and `2` agree.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
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

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A named command with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: String,
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Message without arguments.
    pub fn bare(command: impl Into<String>) -> Self {
        Self::new(command, Vec::new())
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_COMMANDS.contains(&self.command.as_str())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Check that `name` can travel in a command frame.
///
/// Names are 1..=64 bytes of printable ASCII with no whitespace.
pub fn validate_command(name: &str) -> Result<(), CodecError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_COMMAND_LEN
        && name.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(CodecError::InvalidCommand(name.to_string()))
    }
}
