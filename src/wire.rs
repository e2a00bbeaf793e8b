//! Cross-node wire envelope (§6, supplemental): the RPC/HTTP transport
//! itself is out of scope, but the core defines the serializable message
//! shapes so a transport can be bolted on without knowing about sockets.
//! `serde`/`serde_json` throughout for the envelope and payload enums.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::value::Val;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Admin,
    InsertAsync,
    Query,
    InterNode,
    InterNodePartitionXfer,
    MessageSub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    pub correlation_id: u64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(channel: Channel, correlation_id: u64, payload: Payload) -> Envelope {
        Envelope { channel, correlation_id, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    InsertRequest(InsertRequest),
    InsertAck,
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    PartitionXfer(PartitionXferChunk),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertRequest {
    pub table: String,
    pub id: String,
    pub rows: Vec<Json>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub table: String,
    pub source: String,
    #[serde(default)]
    pub params: HashMap<String, Val>,
    /// `Some` promotes the query to a segment query (§6): the result
    /// bitmap is additionally stored under this name in each partition's
    /// attribute store.
    #[serde(default)]
    pub segment: Option<SegmentRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRequest {
    pub name: String,
    pub ttl_ms: i64,
    pub refresh_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub result: Json,
}

/// One length-prefixed chunk of a partition transfer on rebalance (§6):
/// the source streams persons in linear-id order, then the attribute
/// store's compressed bitmaps, tagged with the partition's new ownership
/// epoch so the destination can detect a stale or duplicated transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionXferChunk {
    pub partition: u64,
    pub ownership_epoch: u64,
    pub persons: Vec<Vec<u8>>,
    pub final_chunk: bool,
}
