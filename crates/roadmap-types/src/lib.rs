//! Shared identity, row, and cache-key types for the roadmap planning tracker.
//!
//! This crate is the leaf of the workspace: typed IDs, the table catalogue,
//! untyped rows, typed entities, cache keys, and realtime change events. It
//! has **no internal dependencies**; the sync engine builds on it.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`RowId`]         | Row identity (server or speculative client)  |
//! | [`Table`]         | Collection + its order/parent/log metadata   |
//! | [`Row`]           | Untyped JSON row                             |
//! | [`CacheKey`]      | (table, scope, view) address of a query      |
//! | [`ChangeEvent`]   | INSERT / UPDATE / DELETE push notification   |
//! | [`Entity`]        | Typed decode/encode for each table           |
//! |-------------------|----------------------------------------------|

pub mod entity;
pub mod error;
pub mod event;
pub mod ids;
pub mod key;
pub mod row;
pub mod table;

pub use entity::{
    Deliverable, DeliverableStatus, Entity, Epic, EpicStatus, InitialPlanning, Initiative,
    InitiativeStatus, ReleasePlan, ReleasePlanStatus, Task, TaskDeliverable, TaskStatus,
    TaskUpdate,
};
pub use error::TypesError;
pub use event::{ChangeEvent, ChangeKind};
pub use ids::{RowId, SessionId, UserId};
pub use key::{CacheKey, EntityRef, View};
pub use row::{Row, RowExt, field_row, row_from};
pub use table::Table;
