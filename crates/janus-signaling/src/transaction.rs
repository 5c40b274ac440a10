use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// What a transaction token is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Create,
    Attach,
    Join,
    Configure,
    Trickle,
    Keepalive,
}

/// Source of correlation tokens attached to every outbound request.
pub trait TransactionSource: Send + Sync {
    fn next(&self, purpose: Purpose) -> String;
}

/// Monotonic tokens of the form `<prefix>-<n>`.
///
/// Trickle and keepalive tokens get a `trickle-` / `keepalive-` label in
/// front, which keeps them apart in server logs.
#[derive(Debug)]
pub struct CounterTransactions {
    prefix: String,
    counter: AtomicU64,
}

impl CounterTransactions {
    pub fn new() -> Self {
        let mut prefix = Uuid::new_v4().simple().to_string();
        prefix.truncate(8);
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for CounterTransactions {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionSource for CounterTransactions {
    fn next(&self, purpose: Purpose) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let label = match purpose {
            Purpose::Trickle => "trickle-",
            Purpose::Keepalive => "keepalive-",
            _ => "",
        };
        format!("{label}{}-{n}", self.prefix)
    }
}

/// Handshake request still waiting for its `success` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    CreateSession,
    AttachPlugin,
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::CreateSession => f.write_str("create session"),
            PendingOp::AttachPlugin => f.write_str("attach plugin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub op: PendingOp,
    pub elapsed: Duration,
}

/// Outstanding handshake requests keyed by transaction.
///
/// A reply is acted on only if its transaction is still in here, so a
/// duplicated or stray `success` resolves nothing.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    entries: HashMap<String, (PendingOp, Instant)>,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transaction: impl Into<String>, op: PendingOp) {
        self.entries.insert(transaction.into(), (op, Instant::now()));
    }

    pub fn resolve(&mut self, transaction: &str) -> Option<Resolved> {
        self.entries
            .remove(transaction)
            .map(|(op, sent_at)| Resolved {
                op,
                elapsed: sent_at.elapsed(),
            })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
