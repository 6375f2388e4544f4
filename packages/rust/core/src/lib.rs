//! Pipeline logic for Licitai.
//!
//! Records flow left to right: [`collector`] pulls PNCP notices into the
//! store, [`generator`] turns keyword matches into tasks, the two
//! [`worker::StageWorker`] instantiations ([`analyzer`], [`enricher`]) advance
//! tasks through their stages, and [`reporter`] exports the terminal ones.
//! [`monitor`] follows tasks as they settle.

pub mod admin;
pub mod analyzer;
pub mod classify;
pub mod collector;
pub mod enricher;
pub mod generator;
pub mod monitor;
pub mod reporter;
pub mod search;
pub mod worker;
