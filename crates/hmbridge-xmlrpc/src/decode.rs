//! Decoding of `methodCall` and `methodResponse` documents.

use std::collections::BTreeMap;

use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::RpcError;
use crate::value::{Fault, Value};

/// Maximum element nesting accepted before the document is rejected.
const MAX_DEPTH: usize = 64;

/// A decoded `methodCall`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// The `<methodName>` text.
    pub method: String,
    /// Positional parameters in wire order.
    pub params: Vec<Value>,
}

/// Element tree node produced by the first decoding stage.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn new(start: &BytesStart<'_>) -> Result<Self, RpcError> {
        let local = start.local_name();
        Ok(Self {
            name: std::str::from_utf8(local.as_ref())?.to_string(),
            ..Self::default()
        })
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<Node, RpcError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(RpcError::malformed("document nested too deeply"));
                }
                stack.push(Node::new(&start)?);
            }
            Event::Empty(start) => {
                let node = Node::new(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(cdata) => {
                if let Some(top) = stack.last_mut() {
                    let raw = cdata.into_inner();
                    top.text.push_str(std::str::from_utf8(&raw)?);
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| RpcError::malformed("unbalanced closing tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctype.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(RpcError::malformed("unexpected end of document"));
    }
    root.ok_or_else(|| RpcError::malformed("empty document"))
}

fn parse_value(node: &Node) -> Result<Value, RpcError> {
    let Some(typed) = node.children.first() else {
        return Ok(Value::String(node.text.clone()));
    };

    match typed.name.as_str() {
        "string" => Ok(Value::String(typed.text.clone())),
        "i4" | "int" | "i8" => typed
            .text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| RpcError::malformed(format!("invalid integer: {:?}", typed.text))),
        "boolean" => match typed.text.trim() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            other => Err(RpcError::malformed(format!("invalid boolean: {other:?}"))),
        },
        "double" => typed
            .text
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|_| RpcError::malformed(format!("invalid double: {:?}", typed.text))),
        "dateTime.iso8601" => Ok(Value::DateTime(typed.text.trim().to_string())),
        "base64" => {
            let compact: String = typed.text.split_whitespace().collect();
            let bytes = base64::engine::general_purpose::STANDARD.decode(compact)?;
            Ok(Value::Base64(bytes))
        }
        "array" => {
            let data = typed
                .child("data")
                .ok_or_else(|| RpcError::malformed("<array> without <data>"))?;
            let items = data
                .children_named("value")
                .map(parse_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(items))
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in typed.children_named("member") {
                let name = member
                    .child("name")
                    .ok_or_else(|| RpcError::malformed("<member> without <name>"))?;
                let value = member
                    .child("value")
                    .ok_or_else(|| RpcError::malformed("<member> without <value>"))?;
                members.insert(name.text.clone(), parse_value(value)?);
            }
            Ok(Value::Struct(members))
        }
        "nil" => Ok(Value::Nil),
        other => Err(RpcError::malformed(format!("unknown value type <{other}>"))),
    }
}

fn parse_params(node: Option<&Node>) -> Result<Vec<Value>, RpcError> {
    let Some(params) = node else {
        return Ok(Vec::new());
    };
    params
        .children_named("param")
        .map(|param| {
            let value = param
                .child("value")
                .ok_or_else(|| RpcError::malformed("<param> without <value>"))?;
            parse_value(value)
        })
        .collect()
}

/// Decodes a `methodCall` document.
///
/// # Errors
///
/// Returns `RpcError` if the document is not well-formed XML or does not
/// follow the XML-RPC call grammar.
pub fn parse_method_call(xml: &str) -> Result<MethodCall, RpcError> {
    let root = parse_tree(xml)?;
    if root.name != "methodCall" {
        return Err(RpcError::malformed(format!(
            "expected <methodCall>, found <{}>",
            root.name
        )));
    }

    let method = root
        .child("methodName")
        .map(|n| n.text.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RpcError::malformed("missing <methodName>"))?;

    let params = parse_params(root.child("params"))?;
    tracing::trace!(method = %method, count = params.len(), "decoded method call");

    Ok(MethodCall { method, params })
}

/// Decodes a `methodResponse` document.
///
/// The outer `Result` reports decoding problems; the inner one carries either
/// the single returned value or the fault sent by the peer. A response with
/// no parameter decodes as an empty string.
///
/// # Errors
///
/// Returns `RpcError` if the document is not a well-formed response.
pub fn parse_method_response(xml: &str) -> Result<Result<Value, Fault>, RpcError> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(RpcError::malformed(format!(
            "expected <methodResponse>, found <{}>",
            root.name
        )));
    }

    if let Some(fault) = root.child("fault") {
        let value = fault
            .child("value")
            .ok_or_else(|| RpcError::malformed("<fault> without <value>"))?;
        let value = parse_value(value)?;
        let fault = Fault::from_value(&value)
            .ok_or_else(|| RpcError::malformed("fault value is not a fault struct"))?;
        return Ok(Err(fault));
    }

    let mut params = parse_params(root.child("params"))?;
    if params.is_empty() {
        return Ok(Ok(Value::empty_string()));
    }
    Ok(Ok(params.swap_remove(0)))
}
