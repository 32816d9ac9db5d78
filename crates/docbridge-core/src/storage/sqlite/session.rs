//! Connection checkout for the SQLite backend.
//!
//! Every call takes the database's single connection, runs its closure on the
//! blocking pool and is bounded by the operation deadline. When the caller's
//! future is dropped (or the deadline passes) while the closure runs, the
//! statement in flight is interrupted.

use crate::error::{Error, Result};
use rusqlite::{Connection, InterruptHandle};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

type TxSlot = Arc<Mutex<Option<OwnedMutexGuard<Connection>>>>;

#[derive(Clone)]
enum Binding {
    /// Checks the shared connection out per call
    Shared(Arc<Mutex<Connection>>),
    /// Holds the connection for the lifetime of a transaction
    Transaction(TxSlot),
}

/// A handle that runs closures against the connection.
#[derive(Clone)]
pub(crate) struct Session {
    binding: Binding,
    interrupt: Arc<InterruptHandle>,
    op_timeout: Duration,
    closed: Arc<AtomicBool>,
}

enum Checkout {
    Shared(OwnedMutexGuard<Connection>),
    Transaction(OwnedMutexGuard<Option<OwnedMutexGuard<Connection>>>),
}

impl Checkout {
    fn conn(&mut self) -> Result<&mut Connection> {
        match self {
            Checkout::Shared(conn) => Ok(&mut **conn),
            Checkout::Transaction(slot) => slot
                .as_mut()
                .map(|conn| &mut **conn)
                .ok_or(Error::TransactionClosed),
        }
    }
}

/// Per-call state shared between the caller and the blocking task.
struct CallControl {
    state: AtomicU8,
    gate: std::sync::Mutex<()>,
}

/// Interrupts the running statement if the call is abandoned.
struct InterruptOnDrop {
    control: Arc<CallControl>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let Ok(_gate) = self.control.gate.lock() else {
            return;
        };
        match self.control.state.load(Ordering::Acquire) {
            RUNNING => {
                self.control.state.store(CANCELLED, Ordering::Release);
                self.interrupt.interrupt();
            }
            PENDING => self.control.state.store(CANCELLED, Ordering::Release),
            _ => {}
        }
    }
}

impl Session {
    pub fn shared(
        conn: Arc<Mutex<Connection>>,
        interrupt: Arc<InterruptHandle>,
        op_timeout: Duration,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            binding: Binding::Shared(conn),
            interrupt,
            op_timeout,
            closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("database is closed".to_string()));
        }
        Ok(())
    }

    async fn checkout(&self) -> Result<Checkout> {
        self.ensure_open()?;
        match &self.binding {
            Binding::Shared(conn) => {
                let guard = conn.clone().lock_owned().await;
                Ok(Checkout::Shared(guard))
            }
            Binding::Transaction(slot) => {
                let guard = slot.clone().lock_owned().await;
                if guard.is_none() {
                    return Err(Error::TransactionClosed);
                }
                Ok(Checkout::Transaction(guard))
            }
        }
    }

    /// Run `f` on the connection within the operation deadline.
    pub async fn run<R, F>(&self, op: &'static str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    {
        match tokio::time::timeout(self.op_timeout, self.run_unbounded(op, f)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled(format!(
                "{} exceeded deadline of {:?}",
                op, self.op_timeout
            ))),
        }
    }

    async fn run_unbounded<R, F>(&self, op: &'static str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    {
        let control = Arc::new(CallControl {
            state: AtomicU8::new(PENDING),
            gate: std::sync::Mutex::new(()),
        });
        let _interrupt = InterruptOnDrop {
            control: control.clone(),
            interrupt: self.interrupt.clone(),
        };

        let mut checkout = self.checkout().await?;
        let task_control = control.clone();
        let handle = tokio::task::spawn_blocking(move || {
            if task_control
                .state
                .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::Cancelled(format!("{} abandoned before it started", op)));
            }
            let shared = matches!(checkout, Checkout::Shared(_));
            let result = checkout.conn().and_then(|conn| {
                // A shared checkout must start outside of any transaction; one
                // left open belonged to a dropped transaction handle.
                if shared && !conn.is_autocommit() {
                    tracing::warn!("rolling back transaction abandoned on the shared connection");
                    conn.execute_batch("ROLLBACK")?;
                }
                f(conn)
            });
            if let Ok(_gate) = task_control.gate.lock() {
                let _ = task_control.state.compare_exchange(
                    RUNNING,
                    DONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            drop(checkout);
            result
        });

        let result = handle
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("{} task failed: {}", op, e)))?
            .map_err(Error::classify_interrupt);
        if control.state.load(Ordering::Acquire) == CANCELLED {
            return Err(Error::Cancelled(format!("{} was interrupted", op)));
        }
        result
    }

    /// Check the connection out for a transaction and issue `BEGIN IMMEDIATE`.
    pub async fn begin(&self) -> Result<Session> {
        let Binding::Shared(conn) = &self.binding else {
            return Err(Error::Other(anyhow::anyhow!("nested transactions are not supported")));
        };
        self.ensure_open()?;
        let conn = conn.clone();
        let begin = async move {
            let guard = conn.lock_owned().await;
            tokio::task::spawn_blocking(move || -> Result<OwnedMutexGuard<Connection>> {
                if !guard.is_autocommit() {
                    tracing::warn!("rolling back transaction abandoned on the shared connection");
                    guard.execute_batch("ROLLBACK")?;
                }
                guard.execute_batch("BEGIN IMMEDIATE")?;
                Ok(guard)
            })
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("begin task failed: {}", e)))?
        };
        let guard = tokio::time::timeout(self.op_timeout, begin)
            .await
            .map_err(|_| Error::Cancelled(format!("begin exceeded deadline of {:?}", self.op_timeout)))??;

        tracing::debug!("transaction started");
        Ok(Session {
            binding: Binding::Transaction(Arc::new(Mutex::new(Some(guard)))),
            interrupt: self.interrupt.clone(),
            op_timeout: self.op_timeout,
            closed: self.closed.clone(),
        })
    }

    /// Commit or roll back and release the connection.
    pub async fn finish(&self, commit: bool) -> Result<()> {
        let Binding::Transaction(slot) = &self.binding else {
            return Ok(());
        };
        let conn = slot.lock().await.take().ok_or(Error::TransactionClosed)?;
        let finish = tokio::task::spawn_blocking(move || -> Result<()> {
            if commit {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
            } else {
                conn.execute_batch("ROLLBACK")?;
            }
            Ok(())
        });
        finish
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("transaction task failed: {}", e)))??;
        tracing::debug!("transaction {}", if commit { "committed" } else { "rolled back" });
        Ok(())
    }
}
