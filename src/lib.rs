//! sqlmux - multiplexed SQL query-execution service
//!
//! Clients submit identified queries over one identity-routed socket
//! endpoint; a fixed pool of worker threads executes them against a
//! health-checked connection pool and routes each serialized result
//! back to the originating peer.
//!
//! Crate layout, leaf-first:
//! - [`backend`]: opaque database capability (`Connector` /
//!   `Connection`) and the ordered text [`backend::Row`]
//! - [`pool`]: LIFO connection pool with heartbeat eviction
//! - [`queue`]: FIFO request queue with blocking exactly-once pop
//! - [`codec`]: interchangeable `json` / `msgpack` wire codecs
//! - [`transport`]: identity-routed TCP endpoint and client
//! - [`handler`]: per-request execution and reply emission
//! - [`dispatcher`]: receive loop plus the worker pool
//! - [`pg`]: production backend over the blocking Postgres client

pub mod backend;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod pg;
pub mod pool;
pub mod queue;
pub mod transport;

pub use backend::{Connection, Connector, Row};
pub use codec::{codec_by_name, Codec, DecodedRequest, JsonCodec, MsgpackCodec};
pub use config::{AppConfig, LISTEN_ADDR, WORKER_COUNT};
pub use dispatcher::Dispatcher;
pub use error::{Result, ServerError};
pub use handler::RequestHandler;
pub use pg::PgConnector;
pub use pool::{ConnectionPool, PooledConn};
pub use queue::{PendingRequest, PushError, RequestQueue};
pub use transport::{ClientConn, Endpoint, InboundUnit};
