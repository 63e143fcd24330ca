// Records and atomic write batches exchanged with shard stores

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shardline_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key of a record. Ordered by table, then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub id: u64,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: u64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }

    /// Byte encoding whose lexicographic order matches `Ord`:
    /// table bytes, a NUL separator, then the big-endian id.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.table.is_empty() || self.table.as_bytes().contains(&0) {
            return Err(Error::Validation(format!(
                "invalid table name {:?}",
                self.table
            )));
        }
        let mut out = Vec::with_capacity(self.table.len() + 9);
        out.extend_from_slice(self.table.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.id.to_be_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 10 {
            return Err(Error::Serialization("record key too short".to_string()));
        }
        let (table, rest) = bytes.split_at(bytes.len() - 9);
        if rest[0] != 0 {
            return Err(Error::Serialization("record key missing separator".to_string()));
        }
        let table = std::str::from_utf8(table)
            .map_err(|e| Error::Serialization(format!("record key table: {}", e)))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&rest[1..]);
        Ok(Self::new(table, u64::from_be_bytes(id)))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A tenant row as stored on a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub version: u64,
}

impl Record {
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
            version: 1,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// SHA-256 over the canonical serialization, hex encoded
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("record {}: {}", self.key, e)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("record {}: {}", self.key, e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Record),
    Delete(RecordKey),
}

impl WriteOp {
    pub fn key(&self) -> &RecordKey {
        match self {
            WriteOp::Put(record) => &record.key,
            WriteOp::Delete(key) => key,
        }
    }
}

/// Ordered operations a store applies atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upserts(records: Vec<Record>) -> Self {
        Self {
            ops: records.into_iter().map(WriteOp::Put).collect(),
        }
    }

    pub fn put(mut self, record: Record) -> Self {
        self.ops.push(WriteOp::Put(record));
        self
    }

    pub fn delete(mut self, key: RecordKey) -> Self {
        self.ops.push(WriteOp::Delete(key));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Value each key held before a batch touched it
pub type PriorValues = Vec<(RecordKey, Option<Record>)>;
