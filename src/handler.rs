//! RequestHandler - executes one dequeued request end-to-end
//!
//! Acquire a connection, run the query verbatim, encode, send. Error
//! dispositions follow the service taxonomy: a query failure becomes a
//! wire error only when the active codec can express one; every other
//! failure is logged and the request abandoned (the client applies its
//! own timeout). The pooled-connection guard releases on every path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::error::{Result, ServerError};
use crate::pool::ConnectionPool;
use crate::queue::PendingRequest;
use crate::transport::Endpoint;

/// Progress log cadence, in completed responses.
const PROGRESS_LOG_EVERY: u64 = 500;

pub struct RequestHandler {
    pool: Arc<ConnectionPool>,
    codec: Arc<dyn Codec>,
    endpoint: Arc<Endpoint>,
    responses: AtomicU64,
}

impl RequestHandler {
    pub fn new(pool: Arc<ConnectionPool>, codec: Arc<dyn Codec>, endpoint: Arc<Endpoint>) -> Self {
        Self {
            pool,
            codec,
            endpoint,
            responses: AtomicU64::new(0),
        }
    }

    /// Process one request. Never panics the worker: every failure
    /// path ends in a log line.
    pub fn handle(&self, request: &PendingRequest) {
        if let Err(e) = self.try_handle(request) {
            error!(query_id = %request.query_id, error = %e, "request abandoned");
        }
    }

    fn try_handle(&self, request: &PendingRequest) -> Result<()> {
        let mut conn = self.pool.acquire()?;
        let outcome = conn.execute(&request.query_text);
        // Return the connection before touching the network.
        drop(conn);

        match outcome {
            Ok(rows) => {
                let bytes = self.codec.encode_result(&request.query_id, &rows)?;
                self.endpoint.send(&request.reply_identity, &bytes);
                self.count_response(&request.query_id);
                Ok(())
            }
            Err(err @ ServerError::Query(_)) => {
                match self
                    .codec
                    .encode_error(&request.query_id, err.wire_kind(), &err.to_string())
                {
                    Some(bytes) => {
                        warn!(query_id = %request.query_id, error = %err, "query failed, error reply sent");
                        self.endpoint.send(&request.reply_identity, &bytes);
                        self.count_response(&request.query_id);
                    }
                    None => {
                        // Codec cannot express errors; log and drop.
                        warn!(query_id = %request.query_id, error = %err, "query failed, response dropped");
                    }
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn count_response(&self, query_id: &str) {
        let sent = self.responses.fetch_add(1, Ordering::SeqCst) + 1;
        if sent % PROGRESS_LOG_EVERY == 0 {
            info!(responses = sent, query_id, "progress");
        }
    }

    /// Total responses sent (results and error replies).
    pub fn responses_sent(&self) -> u64 {
        self.responses.load(Ordering::SeqCst)
    }
}
