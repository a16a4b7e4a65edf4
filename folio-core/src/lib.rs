//! # folio-core: Reactive block tree over a CRDT document
//!
//! Every block is a `yrs` map inside the document's `blocks` map. A
//! [`BlockModel`] is the live, typed view of one such record.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  mutations   ┌──────────────┐   observe   ┌──────────────┐
//! │  Document    │ ───────────► │  yrs::Doc    │ ──────────► │ pending      │
//! │  (API)       │ ◄─ updates ─ │  blocks map  │             │ event queue  │
//! └──────┬───────┘              └──────────────┘             └──────┬───────┘
//!        │ flush                                                    │
//!        ▼                                                          │
//! ┌──────────────┐  attach / detach   ┌──────────────┐              │
//! │  BlockIndex  │ ─────────────────► │  BlockModel  │ ◄────────────┘
//! │  id → block  │ ◄── parent lookup  │  signals,    │
//! └──────────────┘                    │  slots       │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`block`]: `BlockModel`, ids, flavours and props
//! - [`document`]: Mutation API, sync and event flush
//! - [`schema`]: Flavour registry and placement rules
//! - [`reactive`]: `Signal` and `Derived` cells
//! - [`slot`]: Event slots and disposable handles
//! - [`snapshot`]: Compressed whole-document export
//! - [`config`]: Document configuration

pub mod block;
pub mod config;
pub mod document;
pub mod error;
pub mod reactive;
pub mod schema;
pub mod slot;
pub mod snapshot;

mod index;
mod locks;

pub use block::{BlockId, BlockModel, Flavour, LifecycleState, Props, PropsUpdated, Role};
pub use config::DocumentConfig;
pub use document::{DeleteOptions, Document, NO_PROPS};
pub use error::{FolioError, Result};
pub use reactive::{Derived, Signal};
pub use schema::{BlockSchema, Schema};
pub use slot::{Disposable, DisposableGroup, LifecycleSlot, Slot};
pub use snapshot::{DocumentSnapshot, SNAPSHOT_FORMAT_VERSION};
