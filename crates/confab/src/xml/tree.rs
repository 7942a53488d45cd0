//! The element tree and its serializer.

use std::collections::HashMap;

use crate::util::markup::escape_text;

/// An attribute, kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub prefix: Option<String>,
    pub value: String,
}

/// A child of an element: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Data(String),
}

/// One XML element.
///
/// `namespace` is the element's resolved namespace URI. `default_namespace`
/// is the default (`xmlns=`) in scope at this element, recorded so namespace
/// resolution never needs to walk to a parent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub prefix: Option<String>,
    namespace: Option<String>,
    default_namespace: Option<String>,
    /// Prefix → URI declarations made on this element.
    declared: HashMap<String, String>,
    attrs: Vec<Attr>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Element {
        Element { name: name.into(), ..Default::default() }
    }

    /// Create an element in a namespace; the namespace also becomes the
    /// default for descendants created through [`Element::new_child`].
    pub fn new_with_ns(name: impl Into<String>, ns: impl Into<String>) -> Element {
        let ns = ns.into();
        Element {
            name: name.into(),
            namespace: Some(ns.clone()),
            default_namespace: Some(ns),
            ..Default::default()
        }
    }

    /// Append a child element, which inherits this element's default
    /// namespace, and return a reference to it.
    pub fn new_child(&mut self, name: impl Into<String>) -> &mut Element {
        let mut child = Element::new(name);
        child.default_namespace = self.default_namespace.clone();
        child.namespace = self.default_namespace.clone();
        self.children.push(Node::Element(child));
        match self.children.last_mut() {
            Some(Node::Element(e)) => e,
            _ => unreachable!(),
        }
    }

    /// Append an already-built child element.
    pub fn append_child(&mut self, child: Element) -> &mut Element {
        self.children.push(Node::Element(child));
        match self.children.last_mut() {
            Some(Node::Element(e)) => e,
            _ => unreachable!(),
        }
    }

    /// Append character data.
    pub fn insert_data(&mut self, data: impl Into<String>) {
        self.children.push(Node::Data(data.into()));
    }

    pub fn set_attrib(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(a) = self.attrs.iter_mut().find(|a| a.name == name && a.prefix.is_none()) {
            a.value = value;
        } else {
            self.attrs.push(Attr { name, prefix: None, value });
        }
    }

    pub fn set_attrib_prefixed(
        &mut self,
        prefix: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.attrs.push(Attr {
            name: name.into(),
            prefix: Some(prefix.into()),
            value: value.into(),
        });
    }

    pub fn get_attrib(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name && a.prefix.is_none())
            .map(|a| a.value.as_str())
    }

    pub fn remove_attrib(&mut self, name: &str) {
        self.attrs.retain(|a| !(a.name == name && a.prefix.is_none()));
    }

    pub fn attrs(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    pub fn set_namespace(&mut self, ns: impl Into<String>) {
        self.namespace = Some(ns.into());
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The default namespace in scope at this element. Inherited from the
    /// ancestor chain at construction/parse time.
    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    pub(crate) fn set_default_namespace(&mut self, ns: Option<String>) {
        self.default_namespace = ns;
    }

    /// Record an `xmlns:prefix="uri"` declaration.
    pub fn declare_prefix(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.declared.insert(prefix.into(), uri.into());
    }

    pub fn declared_prefixes(&self) -> &HashMap<String, String> {
        &self.declared
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Data(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn get_child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// First child element matching name and namespace.
    pub fn get_child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.child_elements()
            .find(|e| e.name == name && e.namespace.as_deref() == Some(ns))
    }

    /// All child elements with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.child_elements().filter(move |e| e.name == name)
    }

    pub fn remove_child(&mut self, name: &str) {
        self.children.retain(|n| !matches!(n, Node::Element(e) if e.name == name));
    }

    /// Concatenated character data of direct children.
    pub fn get_data(&self) -> String {
        let mut out = String::new();
        for n in &self.children {
            if let Node::Data(d) = n {
                out.push_str(d);
            }
        }
        out
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Serialize without whitespace.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None, None);
        out
    }

    /// Serialize pretty-printed, one tab per depth level.
    pub fn to_formatted_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, Some(0), None);
        out
    }

    fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.name),
            None => self.name.clone(),
        }
    }

    fn write(&self, out: &mut String, depth: Option<usize>, parent_default: Option<&str>) {
        if let Some(d) = depth {
            for _ in 0..d {
                out.push('\t');
            }
        }
        out.push('<');
        let qname = self.qualified_name();
        out.push_str(&qname);

        // Emit a default namespace only when it differs from the parent's.
        if self.prefix.is_none() {
            if let Some(ns) = &self.namespace {
                if parent_default != Some(ns.as_str()) {
                    out.push_str(&format!(" xmlns=\"{}\"", escape_text(ns)));
                }
            }
        }
        for (prefix, uri) in &self.declared {
            out.push_str(&format!(" xmlns:{prefix}=\"{}\"", escape_text(uri)));
        }
        for a in &self.attrs {
            match &a.prefix {
                Some(p) => {
                    out.push_str(&format!(" {p}:{}=\"{}\"", a.name, escape_text(&a.value)))
                }
                None => out.push_str(&format!(" {}=\"{}\"", a.name, escape_text(&a.value))),
            }
        }

        if self.children.is_empty() {
            out.push_str("/>");
            if depth.is_some() {
                out.push('\n');
            }
            return;
        }

        out.push('>');
        let child_default = if self.prefix.is_none() {
            self.namespace.as_deref().or(parent_default)
        } else {
            parent_default
        };
        let only_data = self.children.iter().all(|n| matches!(n, Node::Data(_)));
        if depth.is_some() && !only_data {
            out.push('\n');
        }
        for n in &self.children {
            match n {
                Node::Element(e) => {
                    e.write(out, depth.map(|d| d + 1), child_default);
                }
                Node::Data(d) => out.push_str(&escape_text(d)),
            }
        }
        if let Some(d) = depth {
            if !only_data {
                for _ in 0..d {
                    out.push('\t');
                }
            }
        }
        out.push_str(&format!("</{qname}>"));
        if depth.is_some() {
            out.push('\n');
        }
    }
}
