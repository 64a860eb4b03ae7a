//! Error types for the XML-RPC codec.

/// Errors that can occur while decoding an XML-RPC document.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The document is not well-formed XML.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Element or text content is not valid UTF-8.
    #[error("invalid utf-8 in document: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// A `<base64>` value could not be decoded.
    #[error("invalid base64 value: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The XML is well-formed but does not follow the XML-RPC grammar.
    #[error("malformed xml-rpc: {0}")]
    Malformed(String),
}

impl RpcError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
