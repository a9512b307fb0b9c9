//! A planet: one content enclosure with its own symbol table, schema
//! registry, and cell address space.
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use planet_spec::{PlanetId, PlanetResult, SymbolId};

use crate::cell::CellSpace;
use crate::config::HostConfig;
use crate::context::Context;
use crate::registry::SchemaRegistry;
use crate::symbols::SymbolTable;

/// Content and governance enclosure hosted by a [`crate::Host`].
pub struct Planet {
    planet_id: PlanetId,
    ctx: Arc<Context>,
    symbols: Arc<SymbolTable>,
    registry: Arc<SchemaRegistry>,
    cells: CellSpace,
}

impl fmt::Debug for Planet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planet")
            .field("planet_id", &self.planet_id)
            .field("state", &self.ctx.state())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl Planet {
    /// Planet with a fresh symbol table, running under `ctx`.
    pub fn new(planet_id: PlanetId, ctx: Arc<Context>, config: &HostConfig) -> Arc<Self> {
        Self::with_symbols(planet_id, ctx, config, Arc::new(SymbolTable::new()))
    }

    /// Planet over an existing (e.g. restored) symbol table.
    pub fn with_symbols(
        planet_id: PlanetId,
        ctx: Arc<Context>,
        config: &HostConfig,
        symbols: Arc<SymbolTable>,
    ) -> Arc<Self> {
        let registry = Arc::new(SchemaRegistry::new(planet_id, symbols.clone()));
        let cells = CellSpace::new(planet_id, ctx.clone(), config.cell_cmd_capacity);
        Arc::new(Self {
            planet_id,
            ctx,
            symbols,
            registry,
            cells,
        })
    }

    /// This planet's ID.
    pub fn planet_id(&self) -> PlanetId {
        self.planet_id
    }

    /// Interns `value`, issuing a new symbol when unseen and `auto_issue` is set.
    pub fn get_symbol_id(&self, value: &[u8], auto_issue: bool) -> PlanetResult<SymbolId> {
        self.symbols.intern(value, auto_issue)
    }

    /// Reverse symbol lookup.
    pub fn lookup_id(&self, id: SymbolId) -> Option<Bytes> {
        self.symbols.lookup(id)
    }

    /// Symbol table.
    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    /// Schema registry.
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Cell address space.
    pub fn cells(&self) -> &CellSpace {
        &self.cells
    }

    /// Lifecycle context; sessions and cell owners are its children.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// True once a fatal error stopped registrations.
    pub fn is_faulted(&self) -> bool {
        self.registry.is_faulted()
    }
}
