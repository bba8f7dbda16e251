//! # SegLog Testkit
//!
//! Test utilities for SegLog.
//!
//! This crate provides:
//! - Journal fixtures over in-memory and file-backed devices
//! - Property-based record generators using proptest
//! - A crash recovery harness for the segmented journal
//! - Cross-crate integration scenarios
//!
//! ## Usage
//!
//! ```rust,ignore
//! use seglog_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_journal() {
//!     let fixture = SegmentedFixture::mkfs(SubmitterConfig::default(), 8).await;
//!     fixture.journal.submit_record(delta_record(1, 64)).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use seglog_core::{Journal, SubmitterConfig};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
