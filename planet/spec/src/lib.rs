//! Shared planet types: identifiers, attribute schemas, the message envelope,
//! and the error taxonomy used by hosts, sessions, and apps.
#![deny(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
mod msg;
mod schema;

pub use error::{PlanetError, PlanetResult};
pub use msg::{Msg, MsgBatch, MsgOp, PinRequest, Value};
pub use schema::{AttrSchema, AttrSpec, Defs, ValueType};

/// Signals "use the default App for this data model".
///
/// An app claims the default slot by listing this value in its data model
/// URIs; a schema selects it by carrying this value (or nothing) as its
/// app URI.
pub const DEFAULT_APP_FOR_DATA_MODEL: &str = ".";

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// The nil (absent) identifier.
            pub const NIL: Self = Self(0);

            /// True when this is the nil identifier.
            pub fn is_nil(self) -> bool {
                self.0 == 0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a planet hosted by a host.
    PlanetId,
    u64
);
id_type!(
    /// Compact alias for an interned byte value, unique within one planet.
    SymbolId,
    u64
);
id_type!(
    /// Handle for a cell within a planet's address space.
    CellId,
    u64
);
id_type!(
    /// Identifies a registered, resolved attribute schema.
    SchemaId,
    u32
);
