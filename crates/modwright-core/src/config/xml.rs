//! XML configuration parsing and rendering via `quick-xml`.
//!
//! Elements become nested tables, attributes are stored under `@name` keys,
//! mixed text under `#text`, and repeated sibling elements collapse into an
//! array. Good enough for the flat settings documents mods actually ship;
//! this is not a general XML data-binding layer.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

struct Frame {
    name: String,
    map: Map<String, Value>,
    text: String,
}

pub(crate) fn parse(input: &str) -> Result<Value, String> {
    let mut reader = Reader::from_str(input);
    reader.trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(start) => {
                let mut frame = Frame {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    map: Map::new(),
                    text: String::new(),
                };
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| e.to_string())?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value().map_err(|e| e.to_string())?;
                    frame.map.insert(key, Value::String(value.into_owned()));
                }
                stack.push(frame);
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = Map::new();
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| e.to_string())?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value().map_err(|e| e.to_string())?;
                    map.insert(key, Value::String(value.into_owned()));
                }
                let value = if map.is_empty() {
                    Value::String(String::new())
                } else {
                    Value::Object(map)
                };
                attach(&mut stack, &mut root, name, value)?;
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    frame
                        .text
                        .push_str(&text.unescape().map_err(|e| e.to_string())?);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                let frame = stack.pop().ok_or("unbalanced closing tag")?;
                let value = if frame.map.is_empty() {
                    Value::String(frame.text)
                } else {
                    let mut map = frame.map;
                    if !frame.text.is_empty() {
                        map.insert("#text".to_string(), Value::String(frame.text));
                    }
                    Value::Object(map)
                };
                attach(&mut stack, &mut root, frame.name, value)?;
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry no
            // configuration state.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err("unterminated element".to_string());
    }
    let (name, value) = root.ok_or("document has no root element")?;
    let mut doc = Map::new();
    doc.insert(name, value);
    Ok(Value::Object(doc))
}

fn attach(
    stack: &mut [Frame],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            match parent.map.get_mut(&name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    parent.map.insert(name, value);
                }
            }
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err("multiple root elements".to_string());
            }
            *root = Some((name, value));
            Ok(())
        }
    }
}

pub(crate) fn render(value: &Value) -> Result<String, String> {
    let root = value.as_object().ok_or("xml document root must be a table")?;
    if root.len() != 1 {
        return Err("xml document must have exactly one root element".to_string());
    }
    let mut out = String::new();
    for (name, val) in root {
        write_element(name, val, 0, &mut out)?;
    }
    Ok(out)
}

fn write_element(name: &str, value: &Value, depth: usize, out: &mut String) -> Result<(), String> {
    let indent = "  ".repeat(depth);
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(name, item, depth, out)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            out.push_str(&format!("{indent}<{name}"));
            for (key, attr) in map {
                if let Some(attr_name) = key.strip_prefix('@') {
                    out.push_str(&format!(
                        " {attr_name}=\"{}\"",
                        quick_xml::escape::escape(&scalar(attr)?)
                    ));
                }
            }
            let children: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(k, _)| !k.starts_with('@') && k.as_str() != "#text")
                .collect();
            let text = map.get("#text");

            if children.is_empty() && text.is_none() {
                out.push_str("/>\n");
                return Ok(());
            }
            out.push('>');
            if let Some(text) = text {
                out.push_str(&quick_xml::escape::escape(&scalar(text)?));
            }
            if !children.is_empty() {
                out.push('\n');
                for (child, val) in children {
                    write_element(child, val, depth + 1, out)?;
                }
                out.push_str(&indent);
            }
            out.push_str(&format!("</{name}>\n"));
            Ok(())
        }
        scalar_value => {
            let rendered = scalar(scalar_value)?;
            if rendered.is_empty() {
                out.push_str(&format!("{indent}<{name}/>\n"));
            } else {
                out.push_str(&format!(
                    "{indent}<{name}>{}</{name}>\n",
                    quick_xml::escape::escape(&rendered)
                ));
            }
            Ok(())
        }
    }
}

fn scalar(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(format!("cannot render {other:?} as xml text")),
    }
}
