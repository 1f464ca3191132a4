//! Sharded worker pool.
//!
//! Accept loops dispatch connections round-robin onto shard queues. Each
//! shard runs handlers as tasks and, once its queue closes, waits for the
//! in-flight ones to finish. Dropping the pool aborts everything.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::net::connection::{Connection, ConnectionTracker, RequestHandler};
use crate::net::listener::Accepted;

/// Per-shard queue depth; accept loops wait when a shard is this far behind.
const SHARD_QUEUE_DEPTH: usize = 256;

/// Running shards.
pub(crate) struct WorkerPool {
    shards: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `count` shards on the current runtime.
    ///
    /// The pool drains once every returned dispatcher (and its clones) is dropped.
    pub fn start(
        count: usize,
        handler: Option<RequestHandler>,
        tracker: ConnectionTracker,
    ) -> (Self, Dispatcher) {
        let mut shards = JoinSet::new();
        let mut queues = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            queues.push(tx);
            shards.spawn(run_shard(id, rx, handler.clone(), tracker.clone()));
        }

        (Self { shards }, Dispatcher { queues, next: 0 })
    }

    /// Wait for every shard to finish its in-flight connections.
    pub async fn drain(mut self) {
        while let Some(result) = self.shards.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker shard failed");
            }
        }
    }
}

/// Round-robin sender onto the shard queues.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    queues: Vec<mpsc::Sender<Accepted>>,
    next: usize,
}

impl Dispatcher {
    /// Same queues, starting at a different shard.
    pub fn offset(&self, start: usize) -> Self {
        let len = self.queues.len().max(1);
        Self {
            queues: self.queues.clone(),
            next: start % len,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_queues(queues: Vec<mpsc::Sender<Accepted>>) -> Self {
        Self { queues, next: 0 }
    }

    pub async fn dispatch(&mut self, accepted: Accepted) {
        if self.queues.is_empty() {
            return;
        }
        let shard = self.next;
        self.next = (self.next + 1) % self.queues.len();

        if self.queues[shard].send(accepted).await.is_err() {
            tracing::warn!(shard, "Worker shard gone, dropping connection");
        }
    }
}

async fn run_shard(
    id: usize,
    mut queue: mpsc::Receiver<Accepted>,
    handler: Option<RequestHandler>,
    tracker: ConnectionTracker,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            accepted = queue.recv() => match accepted {
                Some(accepted) => serve_connection(&mut in_flight, accepted, handler.as_ref(), &tracker),
                None => break,
            },
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = result {
                    tracing::error!(shard = id, error = %e, "Request handler panicked");
                }
            }
        }
    }

    tracing::debug!(shard = id, in_flight = in_flight.len(), "Draining worker shard");
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            tracing::error!(shard = id, error = %e, "Request handler panicked");
        }
    }
}

fn serve_connection(
    in_flight: &mut JoinSet<()>,
    accepted: Accepted,
    handler: Option<&RequestHandler>,
    tracker: &ConnectionTracker,
) {
    let Accepted {
        stream,
        peer_addr,
        permit,
    } = accepted;

    let Some(handler) = handler else {
        tracing::warn!(peer_addr = %peer_addr, "No request handler attached, closing connection");
        return;
    };

    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(peer_addr = %peer_addr, error = %e, "Failed to register accepted stream");
            return;
        }
    };

    let guard = tracker.track();
    let request = handler.call(Connection::new(guard.id(), peer_addr, stream));
    in_flight.spawn(async move {
        let _guard = guard;
        let _permit = permit;
        request.await;
    });
}
