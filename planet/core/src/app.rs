//! Contracts between the host runtime and apps: [`App`], [`AppCell`],
//! [`CellSub`], and the [`CellReq`] that flows between them.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use planet_spec::{
    AttrSchema, CellId, Msg, MsgBatch, PlanetError, PlanetId, PlanetResult, Value,
};

/// An app resolves pin requests for the data models it claims.
#[async_trait]
pub trait App: Send + Sync + 'static {
    /// Identifies this app, usually `{domain}/{app}/v{MAJOR}.{MINOR}.{REV}`.
    fn app_uri(&self) -> &str;

    /// Data model URIs routed to this app.
    fn data_model_uris(&self) -> Vec<String>;

    /// Resolves `req` to a target cell.
    ///
    /// Must depend only on `(planet_id, pin_uri)` and the app's cell data, and
    /// must not mutate anything on failure.
    async fn resolve_request(&self, req: &CellReq) -> PlanetResult<Resolution>;
}

/// An app's handle for a resolved cell.
#[async_trait]
pub trait AppCell: Send + Sync + 'static {
    /// Pushes full cell state through `req`. Runs on the cell's owner task.
    async fn push_cell_state(&self, req: &CellReq) -> PlanetResult<()>;

    /// Applies an incremental update to the cell's state. Runs on the cell's
    /// owner task when one exists, so it is ordered with pushes.
    fn apply_update(&self, _attrs: &[AttrValue]) {}
}

/// Push channel from a cell owner to one subscriber.
#[async_trait]
pub trait CellSub: Send + Sync {
    /// Request the pushes are tagged with.
    fn req_id(&self) -> u64;

    /// Stamps the request ID on every message and queues the batch,
    /// waiting until it is accepted or the request is canceled.
    async fn push_batch(&self, batch: MsgBatch) -> PlanetResult<()>;

    /// Single-message form of [`CellSub::push_batch`].
    async fn push_msg(&self, msg: Msg) -> PlanetResult<()> {
        self.push_batch(MsgBatch::from(msg)).await
    }

    /// True once the subscriber is gone or canceled.
    fn is_closed(&self) -> bool;
}

/// Everything `App::resolve_request` decides, installed on a request in one step.
#[derive(Clone)]
pub struct Resolution {
    /// Target cell.
    pub pin_cell: CellId,
    /// Schema the cell is presented as.
    pub pin_cell_schema: Arc<AttrSchema>,
    /// Schemas for child cells.
    pub child_schemas: Vec<Arc<AttrSchema>>,
    /// The app's cell handle.
    pub pinned_cell: Arc<dyn AppCell>,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("pin_cell", &self.pin_cell)
            .field("schema_id", &self.pin_cell_schema.schema_id)
            .field("child_schemas", &self.child_schemas.len())
            .finish()
    }
}

/// A named attribute value pushed as an incremental update.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrValue {
    /// Attribute name.
    pub name: String,
    /// New value.
    pub value: Value,
}

impl AttrValue {
    /// Pair a name with a value.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A pin request: who asked, for what, and (once resolved) where it landed.
pub struct CellReq {
    /// Subscriber receiving this request's pushes.
    pub sub: Arc<dyn CellSub>,
    /// App responding to this request.
    pub parent_app: Arc<dyn App>,
    /// Request ID, unique within its session.
    pub req_id: u64,
    /// Request this one is nested under.
    pub parent_req: Option<Arc<CellReq>>,
    /// Planet the pin targets.
    pub planet_id: PlanetId,
    /// Requested URI.
    pub pin_uri: String,
    /// Schema the client asked for.
    pub requested_schema: Arc<AttrSchema>,
    /// Child schemas the client asked for.
    pub requested_child_schemas: Vec<Arc<AttrSchema>>,
    resolution: Option<Resolution>,
}

impl fmt::Debug for CellReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellReq")
            .field("req_id", &self.req_id)
            .field("app", &self.parent_app.app_uri())
            .field("planet_id", &self.planet_id)
            .field("pin_uri", &self.pin_uri)
            .field("resolution", &self.resolution)
            .finish()
    }
}

impl CellReq {
    /// New unresolved request.
    pub fn new(
        sub: Arc<dyn CellSub>,
        parent_app: Arc<dyn App>,
        planet_id: PlanetId,
        pin_uri: impl Into<String>,
        requested_schema: Arc<AttrSchema>,
    ) -> Self {
        Self {
            req_id: sub.req_id(),
            sub,
            parent_app,
            parent_req: None,
            planet_id,
            pin_uri: pin_uri.into(),
            requested_schema,
            requested_child_schemas: Vec::new(),
            resolution: None,
        }
    }

    /// Builder: nest under `parent`.
    pub fn with_parent(mut self, parent: Arc<CellReq>) -> Self {
        self.parent_req = Some(parent);
        self
    }

    /// Builder: request child schemas.
    pub fn with_child_schemas(mut self, schemas: Vec<Arc<AttrSchema>>) -> Self {
        self.requested_child_schemas = schemas;
        self
    }

    /// Installs the app's resolution. A request resolves at most once.
    pub fn resolve(&mut self, resolution: Resolution) -> PlanetResult<()> {
        if self.resolution.is_some() {
            return Err(PlanetError::AlreadyResolved(self.req_id));
        }
        if resolution.pin_cell.is_nil() {
            return Err(PlanetError::UnknownUri(self.pin_uri.clone()));
        }
        self.resolution = Some(resolution);
        Ok(())
    }

    /// True once resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Resolved cell, or nil.
    pub fn pin_cell(&self) -> CellId {
        self.resolution
            .as_ref()
            .map(|r| r.pin_cell)
            .unwrap_or(CellId::NIL)
    }

    /// Resolved schema.
    pub fn pin_cell_schema(&self) -> Option<&Arc<AttrSchema>> {
        self.resolution.as_ref().map(|r| &r.pin_cell_schema)
    }

    /// Resolved child schemas.
    pub fn child_schemas(&self) -> &[Arc<AttrSchema>] {
        self.resolution
            .as_ref()
            .map(|r| r.child_schemas.as_slice())
            .unwrap_or_default()
    }

    /// Resolved app cell.
    pub fn pinned_cell(&self) -> Option<&Arc<dyn AppCell>> {
        self.resolution.as_ref().map(|r| &r.pinned_cell)
    }

    /// Pushes a batch to this request's subscriber.
    pub async fn push_batch(&self, batch: MsgBatch) -> PlanetResult<()> {
        self.sub.push_batch(batch).await
    }

    /// Pushes one message to this request's subscriber.
    pub async fn push_msg(&self, msg: Msg) -> PlanetResult<()> {
        self.sub.push_msg(msg).await
    }

    /// Encodes attribute values against the resolved schema.
    ///
    /// Attributes the schema does not declare are skipped. When `full_state`
    /// is set the batch ends with a checkpoint marker.
    pub fn encode_attrs<'a, I>(&self, attrs: I, full_state: bool) -> MsgBatch
    where
        I: IntoIterator<Item = &'a AttrValue>,
    {
        let mut batch = MsgBatch::new();
        let Some(schema) = self.pin_cell_schema() else {
            return batch;
        };
        let cell_id = self.pin_cell();
        for attr in attrs {
            if let Some(spec) = schema.attr(&attr.name) {
                batch.push(Msg::push_attr(
                    cell_id,
                    schema.schema_id,
                    spec.attr_id,
                    attr.value.clone(),
                ));
            }
        }
        if full_state {
            batch.push(Msg::checkpoint(cell_id, schema.schema_id));
        }
        batch
    }
}
