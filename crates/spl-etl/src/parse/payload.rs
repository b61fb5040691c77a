//! Canonical JSON payload for the Full Representation.
//!
//! Each XML element becomes `{"@name": tag, "@ns": uri?, "@attrs": {..},
//! "#text": text?, "children": [..]}`. Attribute and child order is
//! preserved; the namespace URI is stored once per element. The payload is
//! built as a stack mirroring the event stream, never as a separate DOM.

use serde_json::{Map, Value};

/// One element under construction
struct Frame {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Value>,
}

impl Frame {
    fn into_value(self) -> Value {
        let mut map = Map::new();
        map.insert("@name".to_string(), Value::String(self.name));
        if let Some(ns) = self.ns {
            map.insert("@ns".to_string(), Value::String(ns));
        }
        let mut attrs = Map::new();
        for (key, value) in self.attrs {
            attrs.insert(key, Value::String(value));
        }
        map.insert("@attrs".to_string(), Value::Object(attrs));
        if !self.text.is_empty() {
            map.insert("#text".to_string(), Value::String(self.text));
        }
        map.insert("children".to_string(), Value::Array(self.children));
        Value::Object(map)
    }
}

/// Stack-based payload construction driven by parser events
pub struct PayloadBuilder {
    stack: Vec<Frame>,
    root: Option<Value>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            root: None,
        }
    }

    pub fn start_element(&mut self, name: &str, ns: Option<&str>, attrs: &[(String, String)]) {
        self.stack.push(Frame {
            name: name.to_string(),
            ns: ns.map(str::to_string),
            attrs: attrs.to_vec(),
            text: String::new(),
            children: Vec::new(),
        });
    }

    pub fn text(&mut self, text: &str) {
        if let Some(frame) = self.stack.last_mut() {
            frame.text.push_str(text);
        }
    }

    pub fn end_element(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        let value = frame.into_value();
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(value),
            None => self.root = Some(value),
        }
    }

    pub fn empty_element(&mut self, name: &str, ns: Option<&str>, attrs: &[(String, String)]) {
        self.start_element(name, ns, attrs);
        self.end_element();
    }

    pub fn finish(self) -> Value {
        self.root.unwrap_or(Value::Null)
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-serialize a canonical payload back to XML text.
///
/// Elements are written with their local names; the namespace comes from
/// `@ns`, emitted as a default-namespace declaration wherever it differs
/// from the inherited one. Used by the round-trip tests and diagnostics.
pub fn to_xml(payload: &Value) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    write_element(payload, None, &mut out);
    out
}

fn write_element(element: &Value, inherited_ns: Option<&str>, out: &mut String) {
    let Some(obj) = element.as_object() else {
        return;
    };
    let name = obj.get("@name").and_then(Value::as_str).unwrap_or("_");
    let ns = obj.get("@ns").and_then(Value::as_str);
    let attrs = obj.get("@attrs").and_then(Value::as_object);
    let text = obj.get("#text").and_then(Value::as_str);
    let children = obj.get("children").and_then(Value::as_array);

    out.push('<');
    out.push_str(name);

    let mut declared_default = false;
    if let Some(attrs) = attrs {
        for (key, value) in attrs {
            let value = value.as_str().unwrap_or_default();
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            if key == "xmlns" {
                // Keep the declaration in its original position but make it
                // agree with the element's resolved namespace.
                declared_default = true;
                escape_into(ns.unwrap_or_default(), out);
            } else {
                escape_into(value, out);
            }
            out.push('"');
        }
    }
    if !declared_default && ns != inherited_ns {
        out.push_str(" xmlns=\"");
        escape_into(ns.unwrap_or_default(), out);
        out.push('"');
    }

    let has_children = children.map(|c| !c.is_empty()).unwrap_or(false);
    if text.is_none() && !has_children {
        out.push_str("/>");
        return;
    }

    out.push('>');
    if let Some(text) = text {
        escape_into(text, out);
    }
    if let Some(children) = children {
        for child in children {
            write_element(child, ns, out);
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_payload_shape() {
        let mut builder = PayloadBuilder::new();
        builder.start_element(
            "document",
            Some("urn:hl7-org:v3"),
            &attrs(&[("xmlns", "urn:hl7-org:v3")]),
        );
        builder.empty_element("id", Some("urn:hl7-org:v3"), &attrs(&[("root", "abc")]));
        builder.start_element("title", Some("urn:hl7-org:v3"), &[]);
        builder.text("Drug Facts");
        builder.end_element();
        builder.end_element();

        let payload = builder.finish();
        assert_eq!(payload["@name"], "document");
        assert_eq!(payload["@ns"], "urn:hl7-org:v3");
        let children = payload["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["@name"], "id");
        assert_eq!(children[0]["@attrs"]["root"], "abc");
        assert!(children[0].get("#text").is_none());
        assert_eq!(children[1]["#text"], "Drug Facts");
    }

    #[test]
    fn test_to_xml_escapes_and_nests() {
        let mut builder = PayloadBuilder::new();
        builder.start_element("document", Some("urn:hl7-org:v3"), &[]);
        builder.start_element("name", Some("urn:hl7-org:v3"), &attrs(&[("q", "a\"b")]));
        builder.text("Tylenol <Extra> & More");
        builder.end_element();
        builder.end_element();

        let xml = to_xml(&builder.finish());
        assert!(xml.contains("<document xmlns=\"urn:hl7-org:v3\">"));
        assert!(xml.contains("q=\"a&quot;b\""));
        assert!(xml.contains("Tylenol &lt;Extra&gt; &amp; More"));
        // Children inherit the default namespace without redeclaring it
        assert!(xml.contains("<name q="));
    }

    #[test]
    fn test_mismatched_end_is_ignored() {
        let mut builder = PayloadBuilder::new();
        builder.start_element("document", None, &[]);
        builder.end_element();
        builder.end_element();
        assert_eq!(builder.finish()["@name"], "document");
    }
}
