//! Dispatcher - receive loop and fixed worker pool
//!
//! The receive loop owns the endpoint's inbound path. Per unit:
//!
//! ```text
//! AWAIT_IDENTITY -> AWAIT_DELIMITER -> AWAIT_PAYLOAD
//!   -> DECODE -> (ENQUEUE | REJECT) -> AWAIT_IDENTITY
//! ```
//!
//! A short unit, a non-empty delimiter, an empty payload or a decode
//! failure rejects the whole unit with a log line. The loop never
//! blocks waiting for a malformed completion and never replies to
//! garbage. Valid requests are enqueued without waiting for
//! processing.
//!
//! Workers drain the queue concurrently with the receive loop; worker
//! count is fixed at startup, no dynamic scaling. With more than one
//! worker, completion (and therefore reply) order may differ from
//! arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::queue::{PendingRequest, PushError, RequestQueue};
use crate::transport::{Endpoint, InboundUnit};

/// How long the receive loop waits for traffic before re-checking the
/// stop flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Dispatcher {
    endpoint: Arc<Endpoint>,
    queue: Arc<RequestQueue>,
    codec: Arc<dyn Codec>,
    handler: Arc<RequestHandler>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Spawn the worker pool. The receive loop itself runs on the
    /// thread that later calls `run`.
    pub fn start(
        endpoint: Arc<Endpoint>,
        queue: Arc<RequestQueue>,
        codec: Arc<dyn Codec>,
        handler: Arc<RequestHandler>,
        worker_count: usize,
    ) -> Self {
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || worker_loop(queue, handler))
                    .expect("spawn worker thread"),
            );
        }
        info!(workers = worker_count, codec = codec.name(), "dispatcher started");

        Self {
            endpoint,
            queue,
            codec,
            handler: Arc::clone(&handler),
            workers,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for signalling the receive loop to stop from another
    /// thread (the signal handler).
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the receive loop until the stop flag is raised.
    pub fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let unit = match self.endpoint.recv_timeout(RECV_POLL_INTERVAL) {
                Some(unit) => unit,
                None => continue,
            };
            self.dispatch_unit(unit);
        }
        debug!("receive loop exited");
    }

    /// Validate and enqueue one inbound unit.
    fn dispatch_unit(&self, unit: InboundUnit) {
        if unit.parts.len() < 3 {
            warn!(parts = unit.parts.len(), "short unit discarded");
            return;
        }
        if !unit.parts[1].is_empty() {
            warn!("unit with non-empty delimiter discarded");
            return;
        }
        let payload = &unit.parts[2];
        if payload.is_empty() {
            warn!("unit with empty payload discarded");
            return;
        }

        let decoded = match self.codec.decode_request(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "undecodable payload discarded");
                return;
            }
        };

        let query_id = decoded.id.clone();
        let request = PendingRequest {
            query_id: decoded.id,
            query_text: decoded.query,
            reply_identity: unit.parts[0].clone(),
        };

        match self.queue.push(request) {
            Ok(()) => {}
            Err(PushError::Full) => {
                // Bounded-queue hardening: tell the client when the
                // codec can express it, otherwise behave like the
                // historical drop.
                let err = ServerError::QueueFull;
                warn!(%query_id, "request queue full, rejecting");
                if let Some(bytes) =
                    self.codec
                        .encode_error(&query_id, err.wire_kind(), &err.to_string())
                {
                    self.endpoint.send(&unit.parts[0], &bytes);
                }
            }
            Err(PushError::Closed) => {
                debug!("request arrived during shutdown, dropped");
            }
        }
    }

    /// Graceful stop: end the receive loop, close the queue (workers
    /// finish the item in hand; queued-but-unpopped requests are
    /// abandoned) and join the workers. The caller shuts the pool
    /// down afterwards.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.endpoint.shutdown();
        info!(
            responses = self.handler.responses_sent(),
            "dispatcher shut down"
        );
    }
}

fn worker_loop(queue: Arc<RequestQueue>, handler: Arc<RequestHandler>) {
    while let Some(request) = queue.pop_blocking() {
        handler.handle(&request);
        thread::yield_now();
    }
}
