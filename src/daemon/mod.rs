/// askd daemon: a per-provider RPC server that routes prompts into agent panes
///
/// - `protocol`: JSONL request/response messages
/// - `server`: loopback TCP accept loop with token auth and idle shutdown
/// - `state`: the state file clients use to find the daemon
/// - `worker`: per-session workers that drive one pane at a time
/// - `worker_pool`: get-or-create map from session key to worker
/// - `discovery`: client-side working directory resolution
/// - `client`: thin client with autostart

pub mod client;
pub mod discovery;
pub mod protocol;
pub mod server;
pub mod state;
pub mod worker;
pub mod worker_pool;

pub use client::DaemonClient;
pub use discovery::{resolve_work_dir, ResolutionSource, WorkDirResolution};
pub use protocol::{decode_jsonl, encode_jsonl, RpcRequest, RpcResponse, PROTOCOL_VERSION};
pub use server::{DaemonServer, RequestHandler, ServerConfig};
pub use state::DaemonState;
pub use worker::{AskRequest, CommandFastPath, FastPath, TaskHandle, TaskResult, WorkerContext, WorkerSettings};
pub use worker_pool::{PoolStats, WorkerPool};
