//! The line-oriented text wire protocol (§6).
//!
//! Every request and response is exactly one line. [`Command::parse`] is
//! the single place untrusted text turns into a typed value; anything
//! that does not fit the grammar is a [`crate::Error::Protocol`] and the
//! connection is closed rather than partially handled.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String, req_id: i64 },
    Get { key: String, req_id: i64 },
    Del { key: String, req_id: i64 },
    Join,
}

impl Command {
    /// Parses one request line. Trailing whitespace is ignored; fields
    /// are whitespace-separated; values contain no whitespace.
    pub fn parse(line: &str) -> crate::Result<Self> {
        let mut fields = line.trim_end().split_whitespace();
        let op = fields
            .next()
            .ok_or_else(|| crate::Error::Protocol("empty command".to_string()))?;

        match op {
            "join" => Ok(Command::Join),
            "set" => {
                let key = next_field(&mut fields, "key")?;
                let value = next_field(&mut fields, "value")?;
                let req_id = next_req_id(&mut fields)?;
                ensure_exhausted(fields)?;
                Ok(Command::Set { key, value, req_id })
            }
            "get" => {
                let key = next_field(&mut fields, "key")?;
                let req_id = next_req_id(&mut fields)?;
                ensure_exhausted(fields)?;
                Ok(Command::Get { key, req_id })
            }
            "del" => {
                let key = next_field(&mut fields, "key")?;
                let req_id = next_req_id(&mut fields)?;
                ensure_exhausted(fields)?;
                Ok(Command::Del { key, req_id })
            }
            other => Err(crate::Error::Protocol(format!("unknown operation {other:?}"))),
        }
    }

    /// The key a given command addresses, for routing purposes. `join`
    /// addresses no key and is handled before routing.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Set { key, .. } | Command::Get { key, .. } | Command::Del { key, .. } => Some(key),
            Command::Join => None,
        }
    }

    pub fn req_id(&self) -> Option<i64> {
        match self {
            Command::Set { req_id, .. } | Command::Get { req_id, .. } | Command::Del { req_id, .. } => Some(*req_id),
            Command::Join => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { key, value, req_id } => write!(f, "set {key} {value} {req_id}"),
            Command::Get { key, req_id } => write!(f, "get {key} {req_id}"),
            Command::Del { key, req_id } => write!(f, "del {key} {req_id}"),
            Command::Join => write!(f, "join"),
        }
    }
}

fn next_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    name: &str,
) -> crate::Result<String> {
    fields
        .next()
        .map(str::to_string)
        .ok_or_else(|| crate::Error::Protocol(format!("missing {name}")))
}

fn next_req_id<'a>(fields: &mut impl Iterator<Item = &'a str>) -> crate::Result<i64> {
    let raw = fields
        .next()
        .ok_or_else(|| crate::Error::Protocol("missing req_id".to_string()))?;
    raw.parse::<i64>()
        .map_err(|_| crate::Error::Protocol(format!("invalid req_id {raw:?}")))
}

fn ensure_exhausted<'a>(mut fields: impl Iterator<Item = &'a str>) -> crate::Result<()> {
    if fields.next().is_some() {
        return Err(crate::Error::Protocol("too many fields".to_string()));
    }
    Ok(())
}

/// A one-line response, formatted exactly as the client-side parser
/// expects (§6): `OK`, the absent-key error line, or the `(value, req_id)`
/// tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value { value: String, req_id: i64 },
    NonExistentKey,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => write!(f, "OK"),
            Response::Value { value, req_id } => write!(f, "({value}, {req_id})"),
            Response::NonExistentKey => write!(f, "Error: Non existent key"),
        }
    }
}

impl Response {
    /// Parses a response line as the load-generator client does, to
    /// validate replies without ever evaluating untrusted text as code
    /// (§9 re-architects the source's `eval`-based client parser away).
    pub fn parse(line: &str) -> Option<Response> {
        let line = line.trim_end();
        if line == "OK" {
            return Some(Response::Ok);
        }
        if line == "Error: Non existent key" {
            return Some(Response::NonExistentKey);
        }
        let inner = line.strip_prefix('(')?.strip_suffix(')')?;
        let (value, req_id) = inner.split_once(", ")?;
        let req_id = req_id.parse::<i64>().ok()?;
        Some(Response::Value {
            value: value.to_string(),
            req_id,
        })
    }
}
