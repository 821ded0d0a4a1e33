//! Per-type pack/unpack registry and movable-resource extraction.
//!
//! A packed form is a [`Value::Record`] stamped with a reserved marker field
//! whose value is the codec's type tag; the receiving side uses the tag to
//! select the inverse. Values without a registered codec pass through both
//! directions unchanged.

use std::collections::BTreeMap;

use tracing::warn;

use crate::value::{ArrayView, ByteBuf, Value, ViewKind};

/// Default name of the reserved marker field injected into packed values.
pub const DEFAULT_MARKER: &str = "_cast_to_original_datatype";

/// A pack/unpack pair for one value type, keyed by its type tag.
///
/// `pack` produces the record body; the registry injects the marker field.
/// `movables` lists the movable resources embedded in a matching value.
pub struct Codec {
    pub tag: &'static str,
    pub matches: fn(&Value) -> bool,
    pub pack: fn(&Value) -> BTreeMap<String, Value>,
    pub unpack: fn(BTreeMap<String, Value>) -> Value,
    pub movables: fn(&Value) -> Vec<ByteBuf>,
}

/// Registry of codecs plus the marker field name used by all of them.
pub struct CodecRegistry {
    marker: String,
    codecs: Vec<Codec>,
}

impl CodecRegistry {
    /// An empty registry with the given marker field name.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            codecs: Vec::new(),
        }
    }

    /// A registry preloaded with the built-in codecs for raw byte buffers
    /// and typed numeric array views.
    pub fn with_defaults(marker: impl Into<String>) -> Self {
        let mut registry = Self::new(marker);
        registry.register(Codec {
            tag: "buffer",
            matches: |v| matches!(v, Value::Buffer(_)),
            pack: |v| {
                let mut body = BTreeMap::new();
                body.insert("data".to_string(), v.clone());
                body
            },
            unpack: |mut body| body.remove("data").unwrap_or(Value::Null),
            movables: |v| match v {
                Value::Buffer(buf) => vec![buf.clone()],
                _ => Vec::new(),
            },
        });
        registry.register(Codec {
            tag: "typed_view",
            matches: |v| matches!(v, Value::View(_)),
            pack: |v| {
                let mut body = BTreeMap::new();
                if let Value::View(view) = v {
                    body.insert("kind".to_string(), Value::Text(view.kind.name().to_string()));
                    body.insert("buffer".to_string(), Value::Buffer(view.buffer.clone()));
                }
                body
            },
            unpack: |mut body| {
                let kind = body
                    .remove("kind")
                    .and_then(|k| k.as_text().and_then(ViewKind::from_name));
                let buffer = body.remove("buffer").and_then(|b| match b {
                    Value::Buffer(buf) => Some(buf),
                    _ => None,
                });
                match (kind, buffer) {
                    (Some(kind), Some(buffer)) => Value::View(ArrayView::new(kind, buffer)),
                    _ => {
                        warn!("malformed packed typed view");
                        Value::Null
                    }
                }
            },
            movables: |v| match v {
                Value::View(view) => vec![view.buffer.clone()],
                _ => Vec::new(),
            },
        });
        registry
    }

    pub fn register(&mut self, codec: Codec) {
        self.codecs.push(codec);
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn codec_for(&self, value: &Value) -> Option<&Codec> {
        self.codecs.iter().find(|c| (c.matches)(value))
    }

    fn codec_by_tag(&self, tag: &str) -> Option<&Codec> {
        self.codecs.iter().find(|c| c.tag == tag)
    }

    /// Whether the value's type has a registered codec.
    pub fn is_registered(&self, value: &Value) -> bool {
        self.codec_for(value).is_some()
    }

    /// Pack a value for transfer. Values without a codec are returned
    /// unchanged; packed values are records stamped with the marker field.
    pub fn pack(&self, value: &Value) -> Value {
        match self.codec_for(value) {
            Some(codec) => {
                let mut body = (codec.pack)(value);
                body.insert(self.marker.clone(), Value::Text(codec.tag.to_string()));
                Value::Record(body)
            }
            None => value.clone(),
        }
    }

    /// Invert [`CodecRegistry::pack`], consuming and stripping the marker
    /// field. A value without the marker is returned unchanged.
    pub fn unpack(&self, value: Value) -> Value {
        let mut body = match value {
            Value::Record(body) => body,
            other => return other,
        };
        let Some(tag) = body.remove(&self.marker) else {
            return Value::Record(body);
        };
        let tag = tag.as_text().unwrap_or_default().to_string();
        match self.codec_by_tag(&tag) {
            Some(codec) => (codec.unpack)(body),
            None => {
                warn!(tag, "packed value carries an unknown type tag");
                Value::Record(body)
            }
        }
    }

    /// Every movable resource embedded in the value, recursing through lists
    /// and records, de-duplicated by handle identity.
    pub fn movables(&self, value: &Value) -> Vec<ByteBuf> {
        let mut found = Vec::new();
        self.collect_movables(value, &mut found);
        dedup_buffers(found)
    }

    fn collect_movables(&self, value: &Value, found: &mut Vec<ByteBuf>) {
        if let Some(codec) = self.codec_for(value) {
            found.extend((codec.movables)(value));
            return;
        }
        match value {
            Value::List(items) => {
                for item in items {
                    self.collect_movables(item, found);
                }
            }
            Value::Record(map) => {
                for item in map.values() {
                    self.collect_movables(item, found);
                }
            }
            _ => {}
        }
    }
}

/// Drop duplicate handles, keeping first occurrences.
pub(crate) fn dedup_buffers(buffers: Vec<ByteBuf>) -> Vec<ByteBuf> {
    let mut unique: Vec<ByteBuf> = Vec::with_capacity(buffers.len());
    for buf in buffers {
        if !unique.iter().any(|b| b.ptr_eq(&buf)) {
            unique.push(buf);
        }
    }
    unique
}
