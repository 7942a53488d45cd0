//! DOM-style XML tree with a SAX-driven parser and round-trip serializer.
//!
//! The tree is the working representation for every stanza a protocol
//! touches. Ownership is strictly parental: an element owns its children
//! outright, and namespace context is resolved at construction time, so the
//! tree never needs back-pointers. Serialization round-trips semantically:
//! element order, namespaces and text survive; attribute order is insertion
//! order; prefixes may be renormalized.

mod parser;
mod tree;

pub use parser::parse_document;
pub use tree::{Attr, Element, Node};

/// Errors from XML parsing.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("unexpected end of document")]
    UnexpectedEof,

    #[error("document has no root element")]
    NoRoot,

    #[error("mismatched close tag: expected {expected}, got {got}")]
    MismatchedClose { expected: String, got: String },
}

pub type Result<T> = std::result::Result<T, XmlError>;
