//! Reference app serving in-memory documents addressed by URI.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use planet_spec::{CellId, PlanetError, PlanetResult, Value};
use tracing::debug;

use crate::app::{App, AppCell, AttrValue, CellReq, Resolution};
use crate::planet::Planet;

/// One document: a cell holding named attribute values.
#[derive(Debug)]
pub struct MemoryCell {
    cell_id: CellId,
    attrs: RwLock<Vec<AttrValue>>,
}

impl MemoryCell {
    /// Cell holding `attrs`.
    pub fn new(cell_id: CellId, attrs: Vec<AttrValue>) -> Self {
        Self {
            cell_id,
            attrs: RwLock::new(attrs),
        }
    }

    /// Cell ID issued by the planet.
    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// Current attribute values.
    pub fn attrs(&self) -> Vec<AttrValue> {
        self.attrs.read().clone()
    }

    fn upsert(&self, attr: AttrValue) {
        let mut attrs = self.attrs.write();
        match attrs.iter_mut().find(|a| a.name == attr.name) {
            Some(slot) => slot.value = attr.value,
            None => attrs.push(attr),
        }
    }
}

#[async_trait]
impl AppCell for MemoryCell {
    async fn push_cell_state(&self, req: &CellReq) -> PlanetResult<()> {
        let snapshot = self.attrs();
        req.push_batch(req.encode_attrs(&snapshot, true)).await
    }

    fn apply_update(&self, attrs: &[AttrValue]) {
        for attr in attrs {
            self.upsert(attr.clone());
        }
    }
}

/// App resolving pins against a URI-keyed document map on one planet.
pub struct MemoryApp {
    app_uri: String,
    data_models: Vec<String>,
    planet: Arc<Planet>,
    docs: RwLock<HashMap<String, Arc<MemoryCell>>>,
}

impl MemoryApp {
    /// Empty app on `planet` claiming `data_models`.
    pub fn new<I, S>(app_uri: impl Into<String>, data_models: I, planet: Arc<Planet>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            app_uri: app_uri.into(),
            data_models: data_models.into_iter().map(Into::into).collect(),
            planet,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a document at `uri`, merging into any existing one.
    /// Returns its cell ID.
    ///
    /// Merges go through the cell space like [`MemoryApp::set_attr`], so
    /// subscribers of an existing document see the new values.
    pub async fn put_doc(&self, uri: impl Into<String>, attrs: Vec<AttrValue>) -> CellId {
        let uri = uri.into();
        let cell = {
            let mut docs = self.docs.write();
            match docs.get(&uri) {
                Some(cell) => cell.clone(),
                None => {
                    let cell = MemoryCell::new(self.planet.cells().issue_cell_id(), Vec::new());
                    cell.apply_update(&attrs);
                    let cell_id = cell.cell_id;
                    docs.insert(uri.clone(), Arc::new(cell));
                    debug!(uri = %uri, cell_id = %cell_id, "stored document");
                    return cell_id;
                }
            }
        };
        let cell_id = cell.cell_id;
        self.planet.cells().update(cell_id, cell, attrs).await;
        debug!(uri = %uri, cell_id = %cell_id, "merged document");
        cell_id
    }

    /// Document at `uri`.
    pub fn doc(&self, uri: &str) -> Option<Arc<MemoryCell>> {
        self.docs.read().get(uri).cloned()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// True when no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates one attribute and pushes it to every subscriber of the document.
    pub async fn set_attr(&self, uri: &str, name: &str, value: Value) -> PlanetResult<()> {
        let cell = self
            .doc(uri)
            .ok_or_else(|| PlanetError::UnknownUri(uri.to_string()))?;
        let cell_id = cell.cell_id;
        let attrs = vec![AttrValue::new(name, value)];
        self.planet.cells().update(cell_id, cell, attrs).await;
        Ok(())
    }
}

#[async_trait]
impl App for MemoryApp {
    fn app_uri(&self) -> &str {
        &self.app_uri
    }

    fn data_model_uris(&self) -> Vec<String> {
        self.data_models.clone()
    }

    async fn resolve_request(&self, req: &CellReq) -> PlanetResult<Resolution> {
        if req.planet_id != self.planet.planet_id() {
            return Err(PlanetError::UnknownUri(req.pin_uri.clone()));
        }
        let cell = self
            .doc(&req.pin_uri)
            .ok_or_else(|| PlanetError::UnknownUri(req.pin_uri.clone()))?;
        Ok(Resolution {
            pin_cell: cell.cell_id,
            pin_cell_schema: req.requested_schema.clone(),
            child_schemas: req.requested_child_schemas.clone(),
            pinned_cell: cell,
        })
    }
}
