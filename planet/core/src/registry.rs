//! Schema registry: resolves attribute schema batches against a planet's
//! symbol table, flattens inheritance, and assigns stable schema IDs.
use std::collections::HashMap;
use std::sync::Arc;

use blake3::Hasher;
use parking_lot::RwLock;
use planet_spec::{
    AttrSchema, AttrSpec, Defs, PlanetError, PlanetId, PlanetResult, SchemaId, SymbolId,
};
use tracing::{debug, error};

use crate::symbols::SymbolTable;

/// Read/register access to resolved schemas. Implementations are thread-safe.
pub trait TypeRegistry: Send + Sync {
    /// Resolves and registers every def in `defs`, rewriting them in place.
    ///
    /// The batch is atomic: on error nothing is registered and `defs` is untouched.
    fn resolve_and_register(&self, defs: &mut Defs) -> PlanetResult<()>;

    /// Returns the resolved schema registered under `schema_id`.
    fn get_schema_by_id(&self, schema_id: SchemaId) -> PlanetResult<Arc<AttrSchema>>;
}

type Fingerprint = [u8; 32];

#[derive(Debug)]
struct RegistryState {
    by_id: HashMap<SchemaId, Arc<AttrSchema>>,
    by_fingerprint: HashMap<Fingerprint, SchemaId>,
    by_data_model: HashMap<String, SchemaId>,
    next_id: u32,
    faulted: bool,
}

/// Schema registry bound to one planet's symbol table.
#[derive(Debug)]
pub struct SchemaRegistry {
    planet_id: PlanetId,
    symbols: Arc<SymbolTable>,
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    /// Empty registry for `planet_id`.
    pub fn new(planet_id: PlanetId, symbols: Arc<SymbolTable>) -> Self {
        Self::starting_at(planet_id, symbols, 1)
    }

    /// Empty registry whose next schema ID is `next_id`.
    pub fn starting_at(planet_id: PlanetId, symbols: Arc<SymbolTable>, next_id: u32) -> Self {
        Self {
            planet_id,
            symbols,
            state: RwLock::new(RegistryState {
                by_id: HashMap::new(),
                by_fingerprint: HashMap::new(),
                by_data_model: HashMap::new(),
                next_id: next_id.max(1),
                faulted: false,
            }),
        }
    }

    /// True once a fatal error stopped registrations.
    pub fn is_faulted(&self) -> bool {
        self.state.read().faulted || self.symbols.is_exhausted()
    }

    /// Latest schema registered for a data model URI.
    pub fn schema_for_data_model(&self, data_model_uri: &str) -> Option<Arc<AttrSchema>> {
        let state = self.state.read();
        state
            .by_data_model
            .get(data_model_uri)
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    /// All committed schemas, ordered by ID.
    pub fn schemas(&self) -> Vec<Arc<AttrSchema>> {
        let state = self.state.read();
        let mut out: Vec<_> = state.by_id.values().cloned().collect();
        out.sort_by_key(|s| s.schema_id);
        out
    }

    fn resolve_batch(&self, state: &mut RegistryState, defs: &Defs) -> PlanetResult<Vec<AttrSchema>> {
        let mut batch_index: HashMap<&str, usize> = HashMap::new();
        for (idx, def) in defs.schemas.iter().enumerate() {
            validate(def)?;
            if batch_index.insert(def.data_model_uri.as_str(), idx).is_some() {
                return Err(PlanetError::InvalidSchema(format!(
                    "data model {} defined twice in one batch",
                    def.data_model_uri
                )));
            }
        }

        let mut flattener = Flattener {
            defs: &defs.schemas,
            batch_index: &batch_index,
            committed: state,
            memo: vec![None; defs.schemas.len()],
            visiting: Vec::new(),
        };
        let mut resolved = Vec::with_capacity(defs.schemas.len());
        for (idx, def) in defs.schemas.iter().enumerate() {
            let attrs = flattener.flatten(idx)?;
            resolved.push(AttrSchema {
                attrs,
                ..def.clone()
            });
        }

        for schema in &mut resolved {
            self.intern_names(schema)?;
        }

        let mut staged: HashMap<Fingerprint, SchemaId> = HashMap::new();
        let mut next_id = state.next_id;
        for schema in &mut resolved {
            let fp = fingerprint(schema);
            let existing = state
                .by_fingerprint
                .get(&fp)
                .or_else(|| staged.get(&fp))
                .copied();
            schema.schema_id = match existing {
                Some(id) => id,
                None => {
                    let id = SchemaId(next_id);
                    next_id = next_id
                        .checked_add(1)
                        .ok_or(PlanetError::SchemaSpaceExhausted)?;
                    staged.insert(fp, id);
                    id
                }
            };
        }
        state.next_id = next_id;
        for schema in &resolved {
            let id = schema.schema_id;
            state.by_fingerprint.insert(fingerprint(schema), id);
            state.by_data_model.insert(schema.data_model_uri.clone(), id);
            state
                .by_id
                .entry(id)
                .or_insert_with(|| Arc::new(schema.clone()));
        }
        Ok(resolved)
    }

    fn intern_names(&self, schema: &mut AttrSchema) -> PlanetResult<()> {
        schema.data_model_id = self.symbols.intern_str(&schema.data_model_uri, true)?;
        if !schema.schema_name.is_empty() {
            self.symbols.intern_str(&schema.schema_name, true)?;
        }
        if !schema.app_uri.is_empty() {
            self.symbols.intern_str(&schema.app_uri, true)?;
        }
        for attr in &mut schema.attrs {
            attr.attr_id = self.symbols.intern_str(&attr.name, true)?;
        }
        Ok(())
    }
}

impl TypeRegistry for SchemaRegistry {
    fn resolve_and_register(&self, defs: &mut Defs) -> PlanetResult<()> {
        let mut state = self.state.write();
        if state.faulted || self.symbols.is_exhausted() {
            return Err(PlanetError::PlanetFaulted(self.planet_id));
        }
        match self.resolve_batch(&mut state, defs) {
            Ok(resolved) => {
                debug!(
                    planet_id = %self.planet_id,
                    count = resolved.len(),
                    "registered schema batch"
                );
                defs.schemas = resolved;
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    error!(planet_id = %self.planet_id, "registry faulted: {err}");
                    state.faulted = true;
                }
                Err(err)
            }
        }
    }

    fn get_schema_by_id(&self, schema_id: SchemaId) -> PlanetResult<Arc<AttrSchema>> {
        self.state
            .read()
            .by_id
            .get(&schema_id)
            .cloned()
            .ok_or(PlanetError::SchemaNotFound(schema_id))
    }
}

struct Flattener<'a> {
    defs: &'a [AttrSchema],
    batch_index: &'a HashMap<&'a str, usize>,
    committed: &'a RegistryState,
    memo: Vec<Option<Vec<AttrSpec>>>,
    visiting: Vec<usize>,
}

impl Flattener<'_> {
    fn flatten(&mut self, idx: usize) -> PlanetResult<Vec<AttrSpec>> {
        if let Some(done) = &self.memo[idx] {
            return Ok(done.clone());
        }
        let (defs, batch_index, committed) = (self.defs, self.batch_index, self.committed);
        let def = &defs[idx];
        if self.visiting.contains(&idx) {
            return Err(PlanetError::CyclicInheritance(def.data_model_uri.clone()));
        }
        self.visiting.push(idx);

        let mut attrs = def.attrs.clone();
        for parent in &def.inherits_from {
            let inherited = if let Some(&pidx) = batch_index.get(parent.as_str()) {
                self.flatten(pidx)?
            } else if let Some(schema) = committed
                .by_data_model
                .get(parent)
                .and_then(|id| committed.by_id.get(id))
            {
                schema.attrs.clone()
            } else {
                return Err(PlanetError::MissingAncestor {
                    schema: def.data_model_uri.clone(),
                    ancestor: parent.clone(),
                });
            };
            for attr in inherited {
                if !attrs.iter().any(|a| a.name == attr.name) {
                    attrs.push(attr);
                }
            }
        }

        self.visiting.pop();
        self.memo[idx] = Some(attrs.clone());
        Ok(attrs)
    }
}

fn validate(def: &AttrSchema) -> PlanetResult<()> {
    if def.data_model_uri.is_empty() {
        return Err(PlanetError::InvalidSchema("empty data model uri".into()));
    }
    for (i, attr) in def.attrs.iter().enumerate() {
        if attr.name.is_empty() {
            return Err(PlanetError::InvalidSchema(format!(
                "{}: empty attr name",
                def.data_model_uri
            )));
        }
        if def.attrs[..i].iter().any(|a| a.name == attr.name) {
            return Err(PlanetError::InvalidSchema(format!(
                "{}: duplicate attr {}",
                def.data_model_uri, attr.name
            )));
        }
    }
    Ok(())
}

fn fingerprint(schema: &AttrSchema) -> Fingerprint {
    fn field(hasher: &mut Hasher, bytes: &[u8]) {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let mut hasher = Hasher::new();
    hasher.update(b"planet:schema");
    field(&mut hasher, schema.data_model_uri.as_bytes());
    field(&mut hasher, schema.app_uri.as_bytes());
    field(&mut hasher, schema.schema_name.as_bytes());
    for attr in &schema.attrs {
        field(&mut hasher, attr.name.as_bytes());
        hasher.update(&[attr.value_type as u8]);
    }
    *hasher.finalize().as_bytes()
}

/// Resolves a schema's attribute symbol by name.
pub fn attr_id(schema: &AttrSchema, name: &str) -> Option<SymbolId> {
    schema.attr(name).map(|a| a.attr_id)
}
