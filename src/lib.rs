//! Host performance telemetry with batching, a durable offline queue and
//! background sync to a remote table store.

pub mod agent;
pub mod batch;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod connectivity;
pub mod export;
pub mod queue;
pub mod remote;
pub mod sample;
pub mod source;
pub mod storage;
pub mod sync;
