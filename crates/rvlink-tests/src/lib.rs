//! Integration tests for the rvlink runtime
//!
//! These tests exercise the subsystems together through the injected
//! collaborator traits, with the mock transport and session controller
//! from `rvlink_device::mock`:
//! - property engine under concurrent readers and debounced writers
//! - command runner session gating, retries, and displacement
//! - gateway locator over real UDP sockets on ephemeral ports
//!
//! Run with: cargo test -p rvlink-tests
//!
//! # Test Structure
//!
//! - `pid_sync_test.rs` - cached/single-flight/debounced pid flows
//! - `command_flow_test.rs` - command queueing and retry state machine
//! - `locator_discovery_test.rs` - UDP beacon discovery lifecycle

// This crate only contains tests, no library code
