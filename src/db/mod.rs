//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row slices returned by repositories that are not domain entities.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `docset_publisher::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{Admission, JobLease, NewArticle};
