//! Core of a content-addressed, deduplicating, encrypted backup engine:
//! the object model, cryptography, tree encoding, repository mediation, and
//! the save/restore/verify pipelines built on top of them.
//!
//! This crate is storage- and transport-agnostic: it depends only on the
//! [`store::ObjectStore`] trait. Concrete back-ends (local filesystem, an
//! in-memory store for tests) live in sibling crates.

pub mod cache;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod error;
pub mod keyset;
pub mod listing;
pub mod oid;
pub mod repository;
pub mod restore;
pub mod save;
pub mod store;
pub mod tree;
pub mod verify;
pub mod wire;

pub use error::{RekkordError, RekkordResult};
pub use oid::{Catalog, Hash, Oid};
pub use repository::Repository;
