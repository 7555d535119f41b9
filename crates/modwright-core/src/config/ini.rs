//! Ordered INI parsing and rendering.
//!
//! Hand-rolled rather than delegated to a crate: game config dialects are
//! loose about quoting and casing, and the merger needs insertion order
//! preserved exactly. One level of `[sections]`, global keys before the
//! first header, `;`/`#` comments.

use serde_json::{Map, Value};

pub(crate) fn parse(input: &str) -> Result<Value, String> {
    let mut root: Map<String, Value> = Map::new();
    let mut section: Option<String> = None;

    for (idx, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped
                .strip_suffix(']')
                .ok_or_else(|| format!("line {}: unterminated section header", idx + 1))?
                .trim();
            if name.is_empty() {
                return Err(format!("line {}: empty section name", idx + 1));
            }
            root.entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            section = Some(name.to_string());
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("line {}: empty key", idx + 1));
            }
            let value = Value::String(value.trim().to_string());
            match &section {
                Some(name) => {
                    let entry = root
                        .get_mut(name)
                        .and_then(Value::as_object_mut)
                        .expect("section created on header");
                    entry.insert(key.to_string(), value);
                }
                None => {
                    root.insert(key.to_string(), value);
                }
            }
        } else {
            return Err(format!("line {}: expected 'key = value'", idx + 1));
        }
    }

    Ok(Value::Object(root))
}

pub(crate) fn render(value: &Value) -> Result<String, String> {
    let root = value.as_object().ok_or("ini document root must be a table")?;
    let mut out = String::new();

    for (key, val) in root {
        if !val.is_object() {
            out.push_str(&format!("{key} = {}\n", scalar(val)?));
        }
    }
    for (name, val) in root {
        if let Some(entries) = val.as_object() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{name}]\n"));
            for (key, entry) in entries {
                if entry.is_object() || entry.is_array() {
                    return Err(format!(
                        "ini supports one level of sections; '{name}.{key}' nests deeper"
                    ));
                }
                out.push_str(&format!("{key} = {}\n", scalar(entry)?));
            }
        }
    }
    Ok(out)
}

fn scalar(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(format!("cannot render {other:?} as an ini value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_globals_in_order() {
        let doc = parse("speed = 3\n; comment\n[audio]\nVolume = 50\nMuted = false\n").unwrap();
        let root = doc.as_object().unwrap();
        let keys: Vec<&String> = root.keys().collect();
        assert_eq!(keys, ["speed", "audio"]);
        assert_eq!(doc["audio"]["Volume"], Value::String("50".into()));
    }

    #[test]
    fn round_trips() {
        let text = "speed = 3\n\n[audio]\nVolume = 50\n";
        let doc = parse(text).unwrap();
        assert_eq!(render(&doc).unwrap(), text);
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(parse("not an entry").is_err());
        assert!(parse("[unterminated").is_err());
    }
}
