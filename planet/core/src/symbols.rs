//! Per-planet symbol table: interns byte values into monotonic `u64` IDs.
use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use planet_spec::{PlanetError, PlanetResult, SymbolId};
use tracing::error;

/// First ID handed out by a fresh table.
pub const FIRST_SYMBOL_ID: u64 = 1;

#[derive(Debug)]
struct SymbolState {
    by_value: HashMap<Bytes, SymbolId>,
    by_id: HashMap<SymbolId, Bytes>,
    next: u64,
    exhausted: bool,
}

/// Interning table shared by every session and app of a planet.
///
/// IDs are issued monotonically and never reclaimed.
#[derive(Debug)]
pub struct SymbolTable {
    state: RwLock<SymbolState>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Empty table issuing from [`FIRST_SYMBOL_ID`].
    pub fn new() -> Self {
        Self::starting_at(FIRST_SYMBOL_ID)
    }

    /// Empty table whose next issued ID is `next`.
    pub fn starting_at(next: u64) -> Self {
        Self {
            state: RwLock::new(SymbolState {
                by_value: HashMap::new(),
                by_id: HashMap::new(),
                next: next.max(FIRST_SYMBOL_ID),
                exhausted: false,
            }),
        }
    }

    /// Rebuild a table from persisted `(id, value)` pairs.
    pub fn restore<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (SymbolId, Bytes)>,
    {
        let table = Self::new();
        {
            let mut state = table.state.write();
            for (id, value) in entries {
                if id.is_nil() {
                    continue;
                }
                state.by_value.insert(value.clone(), id);
                state.by_id.insert(id, value);
                if id.0 >= state.next {
                    match id.0.checked_add(1) {
                        Some(next) => state.next = next,
                        None => state.exhausted = true,
                    }
                }
            }
        }
        table
    }

    /// Returns the ID for `value`, issuing one when unseen and `auto_issue` is set.
    ///
    /// An unseen value with `auto_issue == false` yields [`SymbolId::NIL`].
    pub fn intern(&self, value: &[u8], auto_issue: bool) -> PlanetResult<SymbolId> {
        if let Some(id) = self.state.read().by_value.get(value) {
            return Ok(*id);
        }
        if !auto_issue {
            return Ok(SymbolId::NIL);
        }
        let mut state = self.state.write();
        // Another writer may have won the race between the two locks.
        if let Some(id) = state.by_value.get(value) {
            return Ok(*id);
        }
        if state.exhausted {
            return Err(PlanetError::SymbolSpaceExhausted);
        }
        let id = SymbolId(state.next);
        match state.next.checked_add(1) {
            Some(next) => state.next = next,
            None => {
                error!("symbol id space exhausted");
                state.exhausted = true;
                return Err(PlanetError::SymbolSpaceExhausted);
            }
        }
        let value = Bytes::copy_from_slice(value);
        state.by_value.insert(value.clone(), id);
        state.by_id.insert(id, value);
        Ok(id)
    }

    /// Convenience for interning UTF-8 identifiers.
    pub fn intern_str(&self, value: &str, auto_issue: bool) -> PlanetResult<SymbolId> {
        self.intern(value.as_bytes(), auto_issue)
    }

    /// Reverse lookup; unknown IDs yield `None`.
    pub fn lookup(&self, id: SymbolId) -> Option<Bytes> {
        self.state.read().by_id.get(&id).cloned()
    }

    /// True once the ID space ran out.
    pub fn is_exhausted(&self) -> bool {
        self.state.read().exhausted
    }

    /// Number of interned values.
    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    /// True when nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all `(id, value)` pairs, ordered by ID.
    pub fn entries(&self) -> Vec<(SymbolId, Bytes)> {
        let state = self.state.read();
        let mut out: Vec<_> = state
            .by_id
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
