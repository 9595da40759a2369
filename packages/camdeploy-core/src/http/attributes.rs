//! Parser for the attribute-style text returned by application CGIs.
//!
//! `applications/list.cgi` answers with something like
//!
//! ```text
//! <reply result="ok">
//!  <application Name="BatonAnalytic" NiceName="Baton" Version="1.3.21"
//!    Status="Running" License="Valid" />
//! </reply>
//! ```
//!
//! The format is not reliably well-formed XML, so it is scanned for
//! `<tag ...>` elements and `Key="value"` pairs.

use std::collections::HashMap;

/// Attributes of one element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    attributes: HashMap<String, String>,
}

impl Element {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Case-insensitive comparison of an attribute value.
    pub fn is(&self, name: &str, expected: &str) -> bool {
        self.get(name)
            .is_some_and(|v| v.eq_ignore_ascii_case(expected))
    }
}

/// Every `<tag ...>` element in `text`, in document order.
pub fn parse_elements(text: &str, tag: &str) -> Vec<Element> {
    let open = format!("<{}", tag);
    let mut elements = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        // `<applications` must not match a search for `<application`.
        if !after.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            rest = after;
            continue;
        }
        let end = after.find('>').unwrap_or(after.len());
        elements.push(Element {
            attributes: parse_attributes(&after[..end]),
        });
        rest = &after[end..];
    }

    elements
}

/// `Key="value"` pairs inside a tag body. Single quotes are accepted too.
pub fn parse_attributes(body: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut rest = body;

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq]
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .trim();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            rest = &rest[eq + 1..];
            continue;
        };
        let value_start = &after[1..];
        let Some(close) = value_start.find(quote) else {
            break;
        };
        if !key.is_empty() {
            attributes.insert(key.to_string(), value_start[..close].to_string());
        }
        rest = &value_start[close + 1..];
    }

    attributes
}
