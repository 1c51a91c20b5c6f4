//! Long-running consensus tasks
//!
//! A `Processor` performs one iteration per `run` call. The supervisor
//! drives each processor on its own tokio task until it breaks or the
//! shutdown signal is raised, then drains them within a grace period.

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handed to every `run` call
#[derive(Clone)]
pub struct ProcessorContext {
    shutdown: watch::Receiver<bool>,
}

impl ProcessorContext {
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        // a dropped supervisor counts as shutdown
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    /// Sleep unless shutdown comes first; `false` when cancelled
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[async_trait]
pub trait Processor: Send + 'static {
    fn name(&self) -> &'static str;

    /// One iteration; `Break` ends the task
    async fn run(&mut self, ctx: &ProcessorContext) -> ControlFlow<()>;
}

pub struct TaskSupervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
    accepting: bool,
}

impl TaskSupervisor {
    pub fn new(grace: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
            grace,
            accepting: true,
        }
    }

    /// Start driving `processor`; `false` once shutdown has begun
    pub fn spawn<P: Processor>(&mut self, mut processor: P) -> bool {
        if !self.accepting {
            warn!("Supervisor stopped, not starting {}", processor.name());
            return false;
        }

        let name = processor.name();
        let ctx = ProcessorContext {
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(async move {
            debug!("Processor {} started", name);
            while !ctx.is_shutting_down() {
                if processor.run(&ctx).await.is_break() {
                    break;
                }
            }
            debug!("Processor {} finished", name);
        });
        self.handles.push((name, handle));
        true
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_running(&self) -> bool {
        self.accepting && self.handles.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Signal every processor, wait out the grace period, abort stragglers
    pub async fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.shutdown.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.grace;
        for (name, mut handle) in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => warn!("Processor {} panicked", name),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Processor {} did not stop within {:?}, aborting", name, self.grace);
                    handle.abort();
                }
            }
        }
        info!("All consensus processors stopped");
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain(..) {
            handle.abort();
        }
    }
}
