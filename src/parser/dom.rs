use std::collections::BTreeMap;

use scraper::node::Node;
use scraper::ElementRef;
use url::Url;

use crate::source;

/// Owned, immutable snapshot of a parsed HTML subtree.
///
/// `scraper::Html` is not `Send`, so blocks are copied into this form
/// before any await point and the document itself is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DomNode {
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: String,
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<DomNode>,
}

impl Element {
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Builders for hand-made trees.
#[cfg(test)]
impl DomNode {
    pub fn text(content: impl Into<String>) -> Self {
        DomNode::Text(content.into())
    }

    pub fn element(tag: &str, children: Vec<DomNode>) -> Self {
        DomNode::Element(Element {
            tag: tag.to_ascii_lowercase(),
            classes: Vec::new(),
            attrs: BTreeMap::new(),
            children,
        })
    }

    pub fn img(src: &str) -> Self {
        DomNode::element("img", Vec::new()).with_attr("src", src)
    }

    pub fn with_class(mut self, class: &str) -> Self {
        if let DomNode::Element(el) = &mut self {
            el.classes.push(class.to_string());
        }
        self
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        if let DomNode::Element(el) = &mut self {
            el.attrs.insert(name.to_string(), value.to_string());
        }
        self
    }
}

impl DomNode {
    pub fn children(&self) -> &[DomNode] {
        match self {
            DomNode::Text(_) => &[],
            DomNode::Element(el) => &el.children,
        }
    }

    /// Build a snapshot of `el`. When `page` is given, `img` sources are
    /// absolutized against it and unusable sources are dropped.
    pub fn from_element(el: ElementRef<'_>, page: Option<&Url>) -> Self {
        let value = el.value();
        let tag = value.name().to_ascii_lowercase();

        let mut attrs: BTreeMap<String, String> = value
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if tag == "img" {
            if let Some(page) = page {
                match attrs.get("src").and_then(|src| source::absolutize(src, page)) {
                    Some(abs) => {
                        attrs.insert("src".to_string(), abs);
                    }
                    None => {
                        attrs.remove("src");
                    }
                }
            }
        }

        let children = el
            .children()
            .filter_map(|child| match child.value() {
                Node::Text(text) => Some(DomNode::Text(text.text.to_string())),
                Node::Element(_) => {
                    ElementRef::wrap(child).map(|child_el| DomNode::from_element(child_el, page))
                }
                _ => None,
            })
            .collect();

        DomNode::Element(Element {
            tag,
            classes: value.classes().map(str::to_string).collect(),
            attrs,
            children,
        })
    }
}
