//! Planet host runtime: per-planet symbol tables and schema registries, the
//! host and its app registry, client sessions, and the cell
//! pin/resolve/subscribe protocol.
#![deny(missing_docs)]

pub mod app;
pub mod apps;
pub mod cell;
pub mod config;
pub mod context;
pub mod host;
pub mod planet;
pub mod registry;
pub mod session;
pub mod symbols;

pub use app::{App, AppCell, AttrValue, CellReq, CellSub, Resolution};
pub use apps::{MemoryApp, MemoryCell};
pub use cell::CellSpace;
pub use config::HostConfig;
pub use context::{Context, LifecycleState, ShutdownMode};
pub use host::{AppRegistry, Host};
pub use planet::Planet;
pub use registry::{SchemaRegistry, TypeRegistry};
pub use session::{HostSession, ReqState, SessionEndpoint, Subscription, User};
pub use symbols::SymbolTable;

pub use planet_spec;
