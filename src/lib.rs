// Library interface for askd
// The `ask` and `askd` binaries, the integration tests and the benchmarks all
// build on these modules.

pub mod codec;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod hooks;
pub mod persist;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod session;
pub mod terminal;
