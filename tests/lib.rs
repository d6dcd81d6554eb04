//! Shared fixtures and helpers for SwarmFS's integration test binaries.
//!
//! The `[[test]]` targets in this crate (`integration_tests`,
//! `integration_advanced`, `integration_hardening`, `property_tests`) each
//! link against this library for the [`fixtures::TwoNodeFixture`] swarm
//! harness and the CI-timing helpers in [`test_helpers`].

pub mod fixtures {
    //! Reusable multi-node test harnesses.
    include!("fixtures/two_node.rs");
}
