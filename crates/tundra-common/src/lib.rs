//! # tundra-common
//!
//! Common types and constants for the Tundra buffer manager.
//!
//! This crate provides the foundational types used across the Tundra
//! components:
//!
//! - **Types**: Core identifiers (`PageId`, `Lsn`, `DtId`)
//! - **Constants**: Page geometry, I/O alignment, and policy defaults
//!
//! ## Example
//!
//! ```rust
//! use tundra_common::types::{PageId, Lsn};
//!
//! let pid = PageId::new(42);
//! let lsn = Lsn::new(1);
//! assert!(pid.is_valid() && lsn.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{DtId, Lsn, PageId};
