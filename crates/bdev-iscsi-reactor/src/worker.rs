use crate::{PollStatus, Reactor, ThreadHandle};
use anyhow::{Context, ensure};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc,
};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{Level, debug, error, info};

const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// A reactor driven by its own OS thread.
pub struct ReactorThread {
    handle: ThreadHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn an OS thread that runs a fresh reactor until [`ReactorThread::shutdown`].
pub fn spawn_reactor(name: impl Into<String>) -> anyhow::Result<ReactorThread> {
    let name = name.into();
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread_stop = stop.clone();
    let thread_name = name.clone();
    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let span = tracing::span!(Level::INFO, "reactor", name = %thread_name);
            let _enter = span.enter();
            let reactor = Reactor::new(thread_name);
            if ready_tx.send(reactor.handle()).is_err() {
                return;
            }
            debug!("reactor loop starting");
            while !thread_stop.load(Ordering::Acquire) {
                if reactor.run_once() == PollStatus::Idle {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }
            // Deliver whatever was queued before the stop request.
            reactor.run_once();
            debug!("reactor loop exited");
        })
        .with_context(|| format!("spawn reactor thread {name}"))?;
    let handle = ready_rx.recv().context("reactor thread init failed")?;
    info!(reactor = %handle.id(), name = handle.name(), "reactor thread ready");
    Ok(ReactorThread {
        handle,
        stop,
        thread: Some(thread),
    })
}

impl ReactorThread {
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if let Err(err) = thread.join() {
                error!(name = self.handle.name(), "reactor thread panicked: {:?}", err);
            }
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Fixed set of reactor threads.
pub struct ReactorPool {
    threads: Vec<ReactorThread>,
}

impl ReactorPool {
    pub fn new(prefix: &str, count: usize) -> anyhow::Result<Self> {
        ensure!(count > 0, "reactor pool needs at least one thread");
        let threads = (0..count)
            .map(|idx| spawn_reactor(format!("{prefix}-{idx}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { threads })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn handle(&self, idx: usize) -> Option<&ThreadHandle> {
        self.threads.get(idx).map(ReactorThread::handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ThreadHandle> {
        self.threads.iter().map(ReactorThread::handle)
    }

    pub fn shutdown(self) {
        for thread in self.threads {
            thread.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current;

    #[test]
    fn spawned_reactor_runs_messages_on_its_thread() {
        let worker = spawn_reactor("worker-test").expect("spawn");
        let (tx, rx) = mpsc::channel();
        let expected = worker.handle().clone();
        worker
            .handle()
            .send_msg(move || {
                let here = current().expect("running on a reactor");
                tx.send(here == expected).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        worker.shutdown();
    }

    #[test]
    fn pool_threads_are_distinct() {
        let pool = ReactorPool::new("pool-test", 2).expect("pool");
        assert_eq!(pool.len(), 2);
        let a = pool.handle(0).unwrap().id();
        let b = pool.handle(1).unwrap().id();
        assert_ne!(a, b);
        pool.shutdown();
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(ReactorPool::new("none", 0).is_err());
    }
}
