//! Message envelope exchanged between a session and its transport.
use serde::{Deserialize, Serialize};

use crate::{CellId, Defs, SchemaId, SymbolId};

/// Operation kind carried by a [`Msg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgOp {
    /// Client login; payload is the user name.
    Login,
    /// Resolve and register schema defs; payload is [`Value::Defs`].
    ResolveAndRegister,
    /// Pin a cell by URI; payload is [`Value::Pin`].
    PinCell,
    /// Cancel the request identified by `req_id`.
    CancelReq,
    /// Set one attribute of a pinned cell.
    PushAttr,
    /// Marks the end of a full-state push.
    Checkpoint,
    /// The request finished and will receive no further messages.
    ReqComplete,
    /// The request failed; payload is [`Value::Error`].
    ReqDiscarded,
}

/// Typed message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No payload.
    #[default]
    Nil,
    /// Text value.
    Text(String),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Reference to another cell.
    CellRef(CellId),
    /// Schema definitions.
    Defs(Defs),
    /// Pin request parameters.
    Pin(PinRequest),
    /// Error text.
    Error(String),
}

/// Parameters of a [`MsgOp::PinCell`] request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRequest {
    /// URI to resolve, e.g. `/doc/1`.
    pub pin_uri: String,
    /// Registered schema the client wants the cell presented as.
    pub schema_id: SchemaId,
    /// Schemas for child cells, if any.
    #[serde(default)]
    pub child_schema_ids: Vec<SchemaId>,
    /// Request this pin is nested under.
    #[serde(default)]
    pub parent_req_id: Option<u64>,
}

/// A single addressed unit of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    /// Request this message belongs to; set by the subscription on push.
    pub req_id: u64,
    /// Operation kind.
    pub op: MsgOp,
    /// Schema the attribute belongs to.
    pub schema_id: SchemaId,
    /// Attribute symbol.
    pub attr_id: SymbolId,
    /// Cell the attribute belongs to.
    pub cell_id: CellId,
    /// Payload.
    pub value: Value,
}

impl Msg {
    /// New message with the given op and no addressing.
    pub fn new(op: MsgOp) -> Self {
        Self {
            req_id: 0,
            op,
            schema_id: SchemaId::NIL,
            attr_id: SymbolId::NIL,
            cell_id: CellId::NIL,
            value: Value::Nil,
        }
    }

    /// Attribute mutation for a cell.
    pub fn push_attr(cell_id: CellId, schema_id: SchemaId, attr_id: SymbolId, value: Value) -> Self {
        Self {
            cell_id,
            schema_id,
            attr_id,
            value,
            ..Self::new(MsgOp::PushAttr)
        }
    }

    /// Full-state marker for a cell.
    pub fn checkpoint(cell_id: CellId, schema_id: SchemaId) -> Self {
        Self {
            cell_id,
            schema_id,
            ..Self::new(MsgOp::Checkpoint)
        }
    }

    /// Failure reply for a request.
    pub fn discarded(req_id: u64, reason: impl Into<String>) -> Self {
        Self {
            req_id,
            value: Value::Error(reason.into()),
            ..Self::new(MsgOp::ReqDiscarded)
        }
    }

    /// Builder: set the request ID.
    pub fn with_req(mut self, req_id: u64) -> Self {
        self.req_id = req_id;
        self
    }

    /// Builder: set the payload.
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }
}

/// An ordered list of messages delivered as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgBatch {
    /// Messages in push order.
    pub msgs: Vec<Msg>,
}

impl MsgBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, msg: Msg) {
        self.msgs.push(msg);
    }

    /// Stamp every message with `req_id`.
    pub fn set_req_id(&mut self, req_id: u64) {
        for msg in &mut self.msgs {
            msg.req_id = req_id;
        }
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// True when the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

impl From<Msg> for MsgBatch {
    fn from(msg: Msg) -> Self {
        Self { msgs: vec![msg] }
    }
}

impl FromIterator<Msg> for MsgBatch {
    fn from_iter<I: IntoIterator<Item = Msg>>(iter: I) -> Self {
        Self {
            msgs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_stamps_req_id_in_order() {
        let mut batch: MsgBatch = (1..=3)
            .map(|n| Msg::push_attr(CellId(1), SchemaId(1), SymbolId(n), Value::Int(n as i64)))
            .collect();
        batch.set_req_id(77);
        assert!(batch.msgs.iter().all(|m| m.req_id == 77));
        let attrs: Vec<u64> = batch.msgs.iter().map(|m| m.attr_id.0).collect();
        assert_eq!(attrs, vec![1, 2, 3]);
    }

    #[test]
    fn discarded_carries_reason() {
        let msg = Msg::discarded(5, "no app");
        assert_eq!(msg.op, MsgOp::ReqDiscarded);
        assert_eq!(msg.value, Value::Error("no app".into()));
    }
}
