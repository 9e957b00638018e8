//! # localmachine testkit
//!
//! Test utilities for localmachine event sync.
//!
//! This crate provides:
//! - Agents on temporary journals with recording replay handlers
//! - An in-process central service reachable through loopback clients
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use localmachine_testkit::prelude::*;
//!
//! #[test]
//! fn event_reaches_receiver() {
//!     let network = TestNetwork::new();
//!     let (a, b) = (network.agent(), network.agent());
//!     let event = a.emit(b.home(), "ORDER", 32);
//!     a.service.sync_cycle().unwrap();
//!     b.service.sync_cycle().unwrap();
//!     assert_eq!(b.replays.replayed(), vec![event.id]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
