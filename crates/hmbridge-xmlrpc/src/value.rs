//! XML-RPC value model.

use std::collections::BTreeMap;

use base64::Engine;

/// A single XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `<i4>`, `<int>` or `<i8>`.
    Int(i64),
    /// `<boolean>`.
    Bool(bool),
    /// `<string>` or an untyped value.
    String(String),
    /// `<double>`.
    Double(f64),
    /// `<dateTime.iso8601>`, kept in its wire representation.
    DateTime(String),
    /// `<base64>`, decoded.
    Base64(Vec<u8>),
    /// `<array>`.
    Array(Vec<Value>),
    /// `<struct>`.
    Struct(BTreeMap<String, Value>),
    /// `<nil/>` extension.
    Nil,
}

impl Value {
    /// An empty `<array>`.
    pub fn empty_array() -> Self {
        Self::Array(Vec::new())
    }

    /// An empty `<string>`.
    pub fn empty_string() -> Self {
        Self::String(String::new())
    }

    /// An empty `<struct>`.
    pub fn empty_struct() -> Self {
        Self::Struct(BTreeMap::new())
    }

    /// Returns the string payload if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the members if this is a `Struct`.
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Returns the elements if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Renders the value as plain text.
    ///
    /// Scalars render as their natural textual form (`true`/`false` for
    /// booleans, decimal for numbers). Base64 renders in its encoded form.
    /// Composite values render as a compact bracketed list.
    pub fn to_text(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::String(s) | Self::DateTime(s) => s.clone(),
            Self::Double(d) => d.to_string(),
            Self::Base64(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            Self::Array(items) => {
                let inner: Vec<String> = items.iter().map(Value::to_text).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Struct(members) => {
                let inner: Vec<String> = members
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.to_text()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Nil => String::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// An XML-RPC fault returned by a peer or produced by the listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("xml-rpc fault {code}: {message}")]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

impl Fault {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The fault as a `{faultCode, faultString}` struct value.
    pub fn to_value(&self) -> Value {
        let mut members = BTreeMap::new();
        members.insert("faultCode".to_string(), Value::Int(self.code));
        members.insert("faultString".to_string(), Value::String(self.message.clone()));
        Value::Struct(members)
    }

    /// Reads a fault from its struct representation.
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let members = value.as_struct()?;
        let code = match members.get("faultCode")? {
            Value::Int(code) => *code,
            _ => return None,
        };
        let message = members
            .get("faultString")
            .map(Value::to_text)
            .unwrap_or_default();
        Some(Self { code, message })
    }
}
