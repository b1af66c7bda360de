//! Qualified Research Activity allocation engine.
//!
//! Computes, validates, and persists QRA allocations: for a business
//! and a tax year, the share of time/effort/expense attributable to
//! R&D across a multi-level research taxonomy (Category → Area → Focus
//! → Activity → Phase/Step → Subcomponent).
//!
//! The engine is single-threaded, synchronous pure computation over
//! in-memory structures.  All I/O lives behind the [`taxonomy`] catalog
//! and [`store`] repository contracts; internal functions take already
//! resolved data and return synchronously, so operations within one
//! editing session apply strictly in issue order.
//!
//! Module map:
//! - [`taxonomy`] — reference-data contract and tolerant lookup.
//! - [`allocation`] — the sparse editing model and its operations.
//! - [`rollup`] — applied-percent cascade, step aggregates, even
//!   distribution.
//! - [`validation`] — advisory sum-to-100 and ownership checks.
//! - [`normalize`] — sparse map ⇄ relational rows, both directions.
//! - [`export`] — JSON/CSV/SQL emission from the normalized rows.
//! - [`statistics`] — reporting aggregates over exported rows.
//! - [`store`] — typed, versioned persistence boundary.

#![forbid(unsafe_code)]

pub mod allocation;
pub mod export;
pub mod normalize;
pub mod rollup;
pub mod statistics;
pub mod store;
pub mod taxonomy;
pub mod validation;
