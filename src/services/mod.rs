pub mod allocator;
pub mod config_sync;
pub mod enforcement;
pub mod failsafe;
pub mod ingestor;
pub mod mdns;
pub mod registry;
