//! geowindow library
//!
//! Hexagonal grid binning of geotagged events and windowed per-cell counts.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
