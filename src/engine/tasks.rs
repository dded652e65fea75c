// Supervised task set: one handle per background loop, cancelled and joined together.

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TaskSet {
    name: &'static str,
    token: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `fut` on the current runtime; it is dropped at its next await once the set is cancelled.
    pub fn spawn<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let set = self.name;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("{}/{} cancelled", set, label);
                }
                _ = fut => {
                    debug!("{}/{} finished", set, label);
                }
            }
        });

        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((label, handle));
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks that have not finished yet.
    pub fn live(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Cancel every task and wait for all of them to exit.
    ///
    /// Must not be awaited from a task spawned on this same set.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for (label, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("{}/{} panicked: {}", self.name, label, e);
                }
            }
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
