//! End-to-end tests for Swarmfix
//!
//! These tests run complete seed/leech scenarios between simulated nodes,
//! from fixture setup through content verification on disk.

mod swarm_scenarios;
