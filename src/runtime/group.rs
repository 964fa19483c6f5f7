//! Worker loop group: a fixed pool of worker threads plus round-robin
//! assignment of new connections.

use super::worker::{Worker, WorkerHandle, WorkerReport, WorkerSettings};
use super::{ConnectionId, HaltSignal};
use crate::error::ServerError;
use crate::pipeline::PipelineFactory;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

/// How many worker loops to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    Fixed(usize),
    /// One worker per available CPU.
    AvailableParallelism,
}

impl SizePolicy {
    pub fn resolve(self) -> usize {
        match self {
            SizePolicy::Fixed(n) => n.max(1),
            SizePolicy::AvailableParallelism => num_cpus(),
        }
    }
}

pub(crate) struct LoopGroup {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl LoopGroup {
    /// Spawn every worker thread. If one fails to start, the ones already
    /// running are stopped and joined before the error is returned.
    pub fn spawn(
        policy: SizePolicy,
        factory: Arc<PipelineFactory>,
        open: Arc<AtomicUsize>,
        settings: WorkerSettings,
        halt: &HaltSignal,
    ) -> Result<(LoopGroup, Vec<JoinHandle<WorkerReport>>), ServerError> {
        let size = policy.resolve();
        let mut workers = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for worker_id in 0..size {
            match spawn_worker(worker_id, &factory, &open, &settings, halt) {
                Ok((handle, thread)) => {
                    workers.push(handle);
                    threads.push(thread);
                }
                Err(source) => {
                    let partial = LoopGroup {
                        workers,
                        next: AtomicUsize::new(0),
                    };
                    partial.shutdown();
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(ServerError::Spawn {
                        name: format!("worker-{worker_id}"),
                        source,
                    });
                }
            }
        }

        Ok((
            LoopGroup {
                workers,
                next: AtomicUsize::new(0),
            },
            threads,
        ))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Next worker in round-robin order.
    fn next(&self) -> &WorkerHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// Assign a connection to the next worker. Returns the worker id.
    pub fn dispatch(&self, id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> io::Result<usize> {
        let worker = self.next();
        worker.assign(id, stream, peer)?;
        Ok(worker.id)
    }

    /// Tell every worker to drain and stop.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            if let Err(e) = worker.shutdown() {
                warn!(worker = worker.id, error = %e, "Failed to signal worker");
            }
        }
    }
}

/// Raises the halt signal if the worker thread unwinds.
struct HaltOnPanic(HaltSignal);

impl Drop for HaltOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.raise();
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    factory: &Arc<PipelineFactory>,
    open: &Arc<AtomicUsize>,
    settings: &WorkerSettings,
    halt: &HaltSignal,
) -> io::Result<(WorkerHandle, JoinHandle<WorkerReport>)> {
    let (worker, handle) = Worker::new(
        worker_id,
        Arc::clone(factory),
        Arc::clone(open),
        settings.clone(),
    )?;
    let halt = halt.clone();

    let thread = thread::Builder::new()
        .name(format!("worker-{worker_id}"))
        .spawn(move || {
            let _guard = HaltOnPanic(halt.clone());
            match worker.run() {
                Ok(report) => report,
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Worker failed");
                    halt.raise();
                    WorkerReport::default()
                }
            }
        })?;

    Ok((handle, thread))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
