//! `OxideX` memory management infrastructure
//!
//! This crate provides the arena that backs the `OxideC` runtime's metadata:
//! class, category and protocol records, and interned selector names. All of
//! these live for the whole process, so the arena hands out shared references
//! tied to its own lifetime and never runs destructors for what it holds.

pub mod arena;

pub use arena::{ArenaStats, GlobalArena};
