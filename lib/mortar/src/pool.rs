use crate::net::reactor::{Completion, ConnHandle, Delivery, Wakeup};
use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use grout::logging;
use std::thread;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker thread count; 0 means hardware concurrency.
    pub workers: usize,
    /// Purge queued tasks at shutdown instead of draining them. Purged
    /// connections receive the task's refusal bytes.
    pub purge_on_shutdown: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            workers: 0,
            purge_on_shutdown: false,
        }
    }
}

/// One unit of offloaded work. The job owns every input it needs and
/// produces its output as a delivery for the reactor to splice.
pub struct Task {
    pub handle: ConnHandle,
    pub job: Box<dyn FnOnce() -> Delivery + Send>,
    /// Pre-encoded refusal written when the task is purged at shutdown.
    pub on_purge: Vec<u8>,
}

/// Fixed set of threads executing handler bodies off the reactor thread.
/// Results travel through the reactor's completion queue and waker; workers
/// never touch sockets or connection buffers.
pub struct WorkerPool {
    tx: Option<Sender<Task>>,
    rx: Receiver<Task>,
    workers: Vec<thread::JoinHandle<()>>,
    wakeup: Wakeup,
    purge_on_shutdown: bool,
    log: logging::Logger,
}

impl WorkerPool {
    pub fn start(config: PoolConfig, wakeup: Wakeup, log: logging::Logger) -> WorkerPool {
        let count = match config.workers {
            0 => thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(4),
            count => count,
        };

        let (tx, rx) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let rx = rx.clone();
            let wakeup = wakeup.clone();

            let worker = thread::Builder::new()
                .name(format!("pool-worker-{}", index))
                .spawn(move || {
                    for task in rx.iter() {
                        let delivery = (task.job)();

                        // The reactor being gone ends the worker.
                        if wakeup.deliver(task.handle, delivery).has_failed() {
                            return;
                        }
                    }
                })
                .expect("failed to spawn pool worker");

            workers.push(worker);
        }

        logging::info!(log, "worker pool started";
                       "context" => "start",
                       "workers" => count);

        WorkerPool {
            tx: Some(tx),
            rx,
            workers,
            wakeup,
            purge_on_shutdown: config.purge_on_shutdown,
            log,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a task; refused once shutdown has begun.
    pub fn submit(&self, task: Task) -> NetworkResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .map_err(|_| NetworkError::Fatal(ErrorType::PoolClosed)),
            None => Err(NetworkError::Fatal(ErrorType::PoolClosed)),
        }
    }

    /// Refuses new submissions, purges or drains the queue, and joins the
    /// workers.
    pub fn shutdown(&mut self) {
        if self.tx.is_none() {
            return;
        }

        let mut purged = 0;

        if self.purge_on_shutdown {
            while let Ok(task) = self.rx.try_recv() {
                let refusal = Completion {
                    bytes: task.on_purge,
                    keep_alive: false,
                    stream: None,
                    push: false,
                };

                let _ = self.wakeup.deliver(task.handle, Delivery::Done(refusal));
                purged += 1;
            }
        }

        self.tx = None;

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        logging::info!(self.log, "worker pool stopped";
                       "context" => "shutdown",
                       "purged" => purged);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::reactor::{Reactor, ReactorConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig::default(), grout::logging::discard()).unwrap()
    }

    fn noop_delivery() -> Delivery {
        Delivery::Done(Completion {
            bytes: Vec::new(),
            keep_alive: false,
            stream: None,
            push: false,
        })
    }

    #[test]
    fn test_all_tasks_execute() {
        let reactor = reactor();
        let mut pool = WorkerPool::start(
            PoolConfig {
                workers: 4,
                purge_on_shutdown: false,
            },
            reactor.wakeup(),
            grout::logging::discard(),
        );

        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();

            pool.submit(Task {
                handle: ConnHandle {
                    token: 0,
                    generation: 0,
                },
                job: Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    noop_delivery()
                }),
                on_purge: Vec::new(),
            })
            .unwrap();
        }

        pool.shutdown();

        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_submit_after_shutdown_refused() {
        let reactor = reactor();
        let mut pool = WorkerPool::start(
            PoolConfig {
                workers: 1,
                purge_on_shutdown: false,
            },
            reactor.wakeup(),
            grout::logging::discard(),
        );

        pool.shutdown();

        let result = pool.submit(Task {
            handle: ConnHandle {
                token: 0,
                generation: 0,
            },
            job: Box::new(noop_delivery),
            on_purge: Vec::new(),
        });

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::PoolClosed)));
    }

    #[test]
    fn test_purge_flushes_refusals() {
        let reactor = reactor();
        let mut pool = WorkerPool::start(
            PoolConfig {
                workers: 1,
                purge_on_shutdown: true,
            },
            reactor.wakeup(),
            grout::logging::discard(),
        );

        // The first task occupies the single worker so the rest stay
        // queued and get purged.
        pool.submit(Task {
            handle: ConnHandle {
                token: 0,
                generation: 0,
            },
            job: Box::new(|| {
                thread::sleep(Duration::from_millis(100));
                noop_delivery()
            }),
            on_purge: Vec::new(),
        })
        .unwrap();

        for _ in 0..8 {
            pool.submit(Task {
                handle: ConnHandle {
                    token: 0,
                    generation: 0,
                },
                job: Box::new(noop_delivery),
                on_purge: b"refused".to_vec(),
            })
            .unwrap();
        }

        thread::sleep(Duration::from_millis(10));
        pool.shutdown();
    }
}
