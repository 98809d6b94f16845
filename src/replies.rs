use std::collections::HashMap;

use tokio::task::JoinHandle;

struct Pending<R> {
    route: R,
    deadline: JoinHandle<()>,
}

/// Outstanding requests keyed by frame id, each with its deadline task.
pub(crate) struct ReplyRegistry<R> {
    pending: HashMap<u64, Pending<R>>,
}

impl<R> ReplyRegistry<R> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: u64, route: R, deadline: JoinHandle<()>) {
        if let Some(old) = self.pending.insert(id, Pending { route, deadline }) {
            // Ids come from a monotonic counter, so this only happens on wrap.
            old.deadline.abort();
        }
    }

    /// Removes the waiter for `id` and cancels its deadline.
    pub fn take(&mut self, id: u64) -> Option<R> {
        self.pending.remove(&id).map(|p| {
            p.deadline.abort();
            p.route
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
