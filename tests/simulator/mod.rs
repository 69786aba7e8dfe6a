//! Simulator-backed test suite modules
//!
//! Tests are grouped by the layer they exercise: the paced command
//! channel, the chunked upload protocol, session lifecycle and run
//! control, and subnet discovery.

mod channel_test;
mod discovery_test;
mod session_test;
mod support;
mod upload_test;
