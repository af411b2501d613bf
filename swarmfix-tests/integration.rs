//! Integration tests for Swarmfix
//!
//! These tests exercise fixture components together: replay buffers over
//! simulated nodes, the port allocator under contention, the helper service
//! registry with a recording launcher and the multi-node transfer builder.

#[path = "integration/port_allocation.rs"]
mod port_allocation;
#[path = "integration/replay_buffer.rs"]
mod replay_buffer;
#[path = "integration/services.rs"]
mod services;
#[path = "integration/setup_transfer.rs"]
mod setup_transfer;
