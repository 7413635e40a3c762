//! tci-daemon library target.
//!
//! Exposes the wiring module for integration tests. The binary `main.rs`
//! depends on this library target.

pub mod wiring;
