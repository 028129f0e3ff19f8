//! The index-backed async block driver: a single-threaded read-dispatch
//! state machine fronting a fixed-size metadata cache and fd pool. The
//! actual reactor loop and I/O submission live outside this crate (see
//! [`dispatch::DriverHost`]); this crate owns only the dispatch logic and
//! its pools, so it can be driven deterministically in tests.

pub mod cache;
pub mod dispatch;
pub mod fd_pool;
pub mod request_pool;

pub use cache::{Entry, CACHE_SIZE};
pub use dispatch::{Driver, DriverHost};
pub use fd_pool::FILE_POOL_SIZE;
pub use request_pool::{REQUEST_POOL_SIZE, TAPDISK_DATA_REQUESTS};
