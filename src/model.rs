use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

const TAG_IRI: u8 = 0x01;
const TAG_BNODE: u8 = 0x02;
const TAG_TYPED: u8 = 0x03;
const TAG_LANG: u8 = 0x04;

/// An opaque graph term: a named resource, a blank node, or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Iri(String),
    Bnode(String),
    TypedLiteral { value: String, datatype: String },
    LangLiteral { value: String, lang: String },
}

impl Value {
    pub fn iri(s: impl Into<String>) -> Value {
        Value::Iri(s.into())
    }

    pub fn bnode(s: impl Into<String>) -> Value {
        Value::Bnode(s.into())
    }

    pub fn literal(value: impl Into<String>, datatype: impl Into<String>) -> Value {
        Value::TypedLiteral {
            value: value.into(),
            datatype: datatype.into(),
        }
    }

    /// Canonical byte encoding, also used as the node payload in the
    /// primitive log. Every variant is a tag byte followed by
    /// length-prefixed UTF-8 segments.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Value::Iri(s) => {
                buf.push(TAG_IRI);
                write_string(&mut buf, s);
            }
            Value::Bnode(s) => {
                buf.push(TAG_BNODE);
                write_string(&mut buf, s);
            }
            Value::TypedLiteral { value, datatype } => {
                buf.push(TAG_TYPED);
                write_string(&mut buf, value);
                write_string(&mut buf, datatype);
            }
            Value::LangLiteral { value, lang } => {
                buf.push(TAG_LANG);
                write_string(&mut buf, value);
                write_string(&mut buf, lang);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Value> {
        let mut cur = Cursor::new(data);
        let tag = cur.read_u8()?;
        let out = match tag {
            TAG_IRI => Value::Iri(cur.read_string()?),
            TAG_BNODE => Value::Bnode(cur.read_string()?),
            TAG_TYPED => Value::TypedLiteral {
                value: cur.read_string()?,
                datatype: cur.read_string()?,
            },
            TAG_LANG => Value::LangLiteral {
                value: cur.read_string()?,
                lang: cur.read_string()?,
            },
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown value tag: 0x{other:02X}"
                )))
            }
        };
        cur.ensure_consumed()?;
        Ok(out)
    }

    /// Deterministic 16-byte hash of the canonical encoding.
    pub fn hash(&self) -> ValueHash {
        ValueHash::of(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Iri(s) => write!(f, "<{s}>"),
            Value::Bnode(s) => write!(f, "_:{s}"),
            Value::TypedLiteral { value, datatype } => write!(f, "\"{value}\"^^<{datatype}>"),
            Value::LangLiteral { value, lang } => write!(f, "\"{value}\"@{lang}"),
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.index + len > self.data.len() {
            return Err(StoreError::Corruption(
                "unexpected end of value payload".into(),
            ));
        }
        let start = self.index;
        self.index += len;
        Ok(&self.data[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes: [u8; 4] = self
            .read_exact(4)?
            .try_into()
            .expect("slice has exactly 4 bytes");
        let len = u32::from_le_bytes(bytes) as usize;
        let raw = self.read_exact(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::Corruption("invalid UTF-8 in value payload".into()))
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(StoreError::Corruption(
                "unexpected trailing bytes in value payload".into(),
            ));
        }
        Ok(())
    }
}

/// Deterministic 16-byte hash over a value, used to key the value and
/// refcount buckets of the persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueHash(pub [u8; 16]);

impl ValueHash {
    pub fn of(v: &Value) -> ValueHash {
        let digest = Sha256::digest(v.encode());
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        ValueHash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// An addressable position within a quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Subject,
    Predicate,
    Object,
    Label,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Subject,
        Direction::Predicate,
        Direction::Object,
        Direction::Label,
    ];

    /// Single-byte bucket prefix used by the quad indexes.
    pub fn prefix(&self) -> u8 {
        match self {
            Direction::Subject => b's',
            Direction::Predicate => b'p',
            Direction::Object => b'o',
            Direction::Label => b'l',
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Direction::Subject => 0,
            Direction::Predicate => 1,
            Direction::Object => 2,
            Direction::Label => 3,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Subject => "subject",
            Direction::Predicate => "predicate",
            Direction::Object => "object",
            Direction::Label => "label",
        };
        f.write_str(name)
    }
}

/// A directed labeled edge: four values, of which any may be absent.
/// A well-formed quad has at least subject, predicate and object set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Quad {
    pub subject: Option<Value>,
    pub predicate: Option<Value>,
    pub object: Option<Value>,
    pub label: Option<Value>,
}

impl Quad {
    pub fn new(
        subject: impl Into<Option<Value>>,
        predicate: impl Into<Option<Value>>,
        object: impl Into<Option<Value>>,
        label: impl Into<Option<Value>>,
    ) -> Quad {
        Quad {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            label: label.into(),
        }
    }

    pub fn get(&self, d: Direction) -> Option<&Value> {
        match d {
            Direction::Subject => self.subject.as_ref(),
            Direction::Predicate => self.predicate.as_ref(),
            Direction::Object => self.object.as_ref(),
            Direction::Label => self.label.as_ref(),
        }
    }

    pub fn set(&mut self, d: Direction, v: Option<Value>) {
        match d {
            Direction::Subject => self.subject = v,
            Direction::Predicate => self.predicate = v,
            Direction::Object => self.object = v,
            Direction::Label => self.label = v,
        }
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in Direction::ALL {
            if let Some(v) = self.get(d) {
                write!(f, "{v} ")?;
            }
        }
        f.write_str(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() {
        let vals = [
            Value::iri("http://example.org/alice"),
            Value::bnode("b42"),
            Value::literal("12", "http://www.w3.org/2001/XMLSchema#integer"),
            Value::LangLiteral {
                value: "bonjour".into(),
                lang: "fr".into(),
            },
        ];
        for v in vals {
            let decoded = Value::decode(&v.encode()).expect("decode");
            assert_eq!(v, decoded);
        }
    }

    #[test]
    fn hash_is_deterministic_and_distinct() {
        let a = Value::iri("http://example.org/a");
        let b = Value::iri("http://example.org/b");
        assert_eq!(a.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
        // An IRI and a bnode with the same spelling hash differently.
        assert_ne!(Value::iri("x").hash(), Value::bnode("x").hash());
    }

    #[test]
    fn truncated_value_payload_is_corruption() {
        let mut enc = Value::iri("http://example.org/alice").encode();
        enc.truncate(enc.len() - 3);
        assert!(matches!(
            Value::decode(&enc),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn string_forms() {
        assert_eq!(Value::iri("a").to_string(), "<a>");
        assert_eq!(Value::bnode("n1").to_string(), "_:n1");
        assert_eq!(
            Value::literal("1", "int").to_string(),
            "\"1\"^^<int>"
        );
    }
}
