//! casegrid-lib: core orchestration for simulation parameter sweeps.
//!
//! This crate provides the pieces the `cgrid` binary wires together:
//! - `node` / `store`: statepoint-addressed nodes with mutable documents
//! - `spec` / `expand`: declarative variation specs and tree expansion
//! - `materialize`: parent → child case directories with copy-on-write
//! - `tracker`: content-hash drift detection for case files
//! - `lifecycle`: the per-node state machine, command runner and run probe
//! - `query`: predicate selection over node documents
//! - `view`: the human-browsable symlink tree over leaf cases

pub mod conf;
pub mod consts;
pub mod expand;
pub mod lifecycle;
pub mod materialize;
pub mod node;
pub mod query;
pub mod spec;
pub mod store;
pub mod tracker;
pub mod view;
