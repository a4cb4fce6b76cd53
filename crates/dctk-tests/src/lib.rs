//! Integration and property tests for the dctk workspace.
//!
//! The [`harness`] module provides a minimal in-process NMDC hub so two
//! real clients can complete logins, chat, search and transfers over
//! localhost, without external infrastructure.

pub mod harness;

#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod transfer_tests;
