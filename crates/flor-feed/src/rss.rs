//! Streaming RSS 2.0 / RDF reader producing flat per-item child maps.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value as JsonValue};

const ROOT_ELEMENTS: [&str; 2] = ["rss", "RDF"];
const ITEM: &str = "item";

/// One `<item>` as its direct children, in document order. Repeated children
/// (several `<category>`) keep every occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RawItem {
    pub index: usize,
    pub children: Vec<(String, String)>,
}

impl RawItem {
    pub fn first(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (key, value) in &self.children {
            let value = JsonValue::String(value.clone());
            match map.get_mut(key) {
                None => {
                    map.insert(key.clone(), value);
                }
                Some(JsonValue::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = JsonValue::Array(vec![first, value]);
                }
            }
        }
        JsonValue::Object(map)
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn link_attribute(start: &BytesStart<'_>) -> String {
    ["url", "href"]
        .iter()
        .find_map(|key| start.try_get_attribute(*key).ok().flatten())
        .and_then(|attr| attr.unescape_value().ok().map(Cow::into_owned))
        .unwrap_or_default()
}

/// Reads every `<item>` of the document. Structural problems (bad XML, a root
/// that is not a feed, truncated input) fail the whole document.
pub(crate) fn read_items(bytes: &[u8]) -> Result<Vec<RawItem>, String> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut items = Vec::new();
    let mut current: Option<RawItem> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| format!("xml error at byte {}: {err}", reader.buffer_position()))?;
        match event {
            Event::Eof => break,
            Event::Start(start) => {
                let name = local_name(&start);
                if stack.is_empty() {
                    if saw_root || !ROOT_ELEMENTS.contains(&name.as_str()) {
                        return Err(format!("unexpected root element <{name}>"));
                    }
                    saw_root = true;
                }
                if name == ITEM && current.is_none() {
                    current = Some(RawItem {
                        index: items.len(),
                        ..RawItem::default()
                    });
                } else if stack.last().map(String::as_str) == Some(ITEM) {
                    text.clear();
                }
                stack.push(name);
            }
            Event::Empty(empty) => {
                let name = local_name(&empty);
                if stack.is_empty() {
                    return Err(format!("unexpected root element <{name}/>"));
                }
                if let Some(item) = current.as_mut() {
                    if stack.last().map(String::as_str) == Some(ITEM) {
                        item.children.push((name, link_attribute(&empty)));
                    }
                }
            }
            Event::Text(chunk) => {
                if current.is_some() {
                    let unescaped = chunk.unescape().map_err(|err| err.to_string())?;
                    text.push_str(&unescaped);
                }
            }
            Event::CData(chunk) => {
                if current.is_some() {
                    text.push_str(&String::from_utf8_lossy(&chunk));
                }
            }
            Event::End(_) => {
                let Some(name) = stack.pop() else {
                    return Err("unbalanced closing tag".to_string());
                };
                let parent_is_item = stack.last().map(String::as_str) == Some(ITEM);
                if name == ITEM && !stack.iter().any(|open| open == ITEM) {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                } else if parent_is_item {
                    if let Some(item) = current.as_mut() {
                        item.children.push((name, text.trim().to_string()));
                    }
                    text.clear();
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(format!("document ended inside <{open}>"));
    }
    if !saw_root {
        return Err("document has no feed root element".to_string());
    }
    Ok(items)
}
