//! Background TTL expiry.

use super::traits::Database;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodically calls [`Database::sweep_expired`] until stopped or the
/// database is dropped.
#[derive(Default)]
pub(crate) struct Sweeper {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn start(&self, db: Weak<dyn Database>, interval: Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(db) = db.upgrade() else {
                    break;
                };
                match db.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("TTL sweep expired {} documents", n),
                    Err(e) => tracing::warn!("TTL sweep failed: {}", e),
                }
            }
        });
        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
