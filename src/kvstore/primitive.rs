use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::graph::QuadIds;
use crate::model::{Direction, Value};

const FLAG_DELETED: u8 = 0x01;
const FLAG_HAS_VALUE: u8 = 0x02;

/// The unit of durable state: either a node (serialized value payload) or
/// a quad (four direction ids). Tombstoned quads stay in the log with
/// `deleted` set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Primitive {
    pub id: u64,
    pub subject: u64,
    pub predicate: u64,
    pub object: u64,
    pub label: u64,
    pub timestamp: i64,
    pub deleted: bool,
    pub value: Vec<u8>,
}

impl Primitive {
    /// A node primitive carrying the value's canonical encoding.
    pub fn node(v: &Value) -> Primitive {
        Primitive {
            value: v.encode(),
            timestamp: unix_nanos(),
            ..Primitive::default()
        }
    }

    pub fn is_node(&self) -> bool {
        !self.value.is_empty()
    }

    pub fn get_direction(&self, d: Direction) -> u64 {
        match d {
            Direction::Subject => self.subject,
            Direction::Predicate => self.predicate,
            Direction::Object => self.object,
            Direction::Label => self.label,
        }
    }

    pub fn set_direction(&mut self, d: Direction, id: u64) {
        match d {
            Direction::Subject => self.subject = id,
            Direction::Predicate => self.predicate = id,
            Direction::Object => self.object = id,
            Direction::Label => self.label = id,
        }
    }

    pub fn quad_ids(&self) -> QuadIds {
        QuadIds {
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
            label: self.label,
        }
    }

    /// Whether both primitives link the same four nodes.
    pub fn is_same_link(&self, other: &Primitive) -> bool {
        self.subject == other.subject
            && self.predicate == other.predicate
            && self.object == other.object
            && self.label == other.label
    }

    /// The decoded value of a node primitive.
    pub fn decode_value(&self) -> Result<Value> {
        Value::decode(&self.value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + self.value.len() + 4);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.subject.to_le_bytes());
        buf.extend_from_slice(&self.predicate.to_le_bytes());
        buf.extend_from_slice(&self.object.to_le_bytes());
        buf.extend_from_slice(&self.label.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        let mut flags = 0u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if !self.value.is_empty() {
            flags |= FLAG_HAS_VALUE;
        }
        buf.push(flags);
        if !self.value.is_empty() {
            buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
            buf.extend_from_slice(&self.value);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Primitive> {
        let mut cur = Cursor::new(data);
        let id = cur.read_u64()?;
        let subject = cur.read_u64()?;
        let predicate = cur.read_u64()?;
        let object = cur.read_u64()?;
        let label = cur.read_u64()?;
        let timestamp = cur.read_u64()? as i64;
        let flags = cur.read_u8()?;
        let value = if flags & FLAG_HAS_VALUE != 0 {
            let len = cur.read_u32()? as usize;
            cur.read_exact(len)?.to_vec()
        } else {
            Vec::new()
        };
        cur.ensure_consumed()?;
        Ok(Primitive {
            id,
            subject,
            predicate,
            object,
            label,
            timestamp,
            deleted: flags & FLAG_DELETED != 0,
            value,
        })
    }
}

pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
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
            return Err(StoreError::Corruption("truncated primitive".into()));
        }
        let start = self.index;
        self.index += len;
        Ok(&self.data[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .read_exact(4)?
            .try_into()
            .expect("slice has exactly 4 bytes");
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .read_exact(8)?
            .try_into()
            .expect("slice has exactly 8 bytes");
        Ok(u64::from_le_bytes(bytes))
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(StoreError::Corruption(
                "unexpected trailing bytes in primitive".into(),
            ));
        }
        Ok(())
    }
}
