//! Event-style flags built on `tokio::sync::watch`.

use tokio::sync::watch;

/// A settable flag that tasks can await.
///
/// Clones share state. Whether the flag is edge- or level-triggered is the
/// consumer's choice: call [`Flag::clear`] after observing it for edge
/// semantics, or leave it set for level semantics.
#[derive(Debug, Clone)]
pub struct Flag {
    tx: watch::Sender<bool>,
}

impl Flag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately when already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender half lives in self, so wait_for cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_observes_set_from_another_task() {
        let flag = Flag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.set();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn clear_resets_edge_semantics() {
        let flag = Flag::new();
        flag.set();
        assert!(flag.is_set());
        flag.wait().await;
        flag.clear();
        assert!(!flag.is_set());
    }
}
