//! Type definitions for Tundra.
//!
//! This module contains the core identifier types used across the
//! buffer manager.

mod ids;

pub use ids::{DtId, Lsn, PageId};
