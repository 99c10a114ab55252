//! `ecdb-transform`: a bulk identity-remapping transformer that copies one
//! engineering-model SQLite database into another, rewriting every internal
//! 64-bit identifier and reference along the way.
//!
//! The pieces, in the order the [`orchestrator::Orchestrator`] drives them:
//!
//! - [`ref_type_cache`] -- which entity kind (element, model, aspect,
//!   codespec) a given class's reference property points at.
//! - [`remap_table`] -- the sparse, run-length-encoded `source -> target` id
//!   map each entity kind uses.
//! - [`class_plan`] -- the SQL text synthesized once per class.
//! - [`remap_context`] -- owns the four remap tables and answers
//!   `findTarget*Id` queries, including relationship endpoint recursion.
//! - [`cloner`] -- turns one source row into a bound target row.
//! - [`orchestrator`] -- drives the whole two-pass copy end to end.

pub mod class_plan;
pub mod cloner;
pub mod code;
pub mod config;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod ref_type_cache;
pub mod remap_context;
pub mod remap_table;
pub mod schema;
pub mod sqlfn;
pub mod state;

pub use cloner::{
    Cloner,
    OnClonedHook,
    SpecialHandler,
};
pub use code::Code;
pub use config::{
    DanglingReferencesBehavior,
    TransformConfig,
};
pub use error::{
    TransformError,
    TransformErrorCode,
};
pub use ids::{
    EntityKind,
    EntityRef,
    Id,
};
pub use orchestrator::{
    Orchestrator,
    TransformReport,
};
pub use ref_type_cache::RefTypeCache;
pub use remap_context::RemapContext;
pub use remap_table::CompactRemapTable;
pub use schema::{
    ClassDescriptor,
    ClassName,
    PropertyDescriptor,
    PropertyKind,
    SchemaCatalog,
};
