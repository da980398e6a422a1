//! Read-modify-write transactions: reads capture snapshot versions, staged
//! writes commit as one batch with per-operation preconditions, and
//! conflicts re-run the caller's closure with fresh reads under full-jitter
//! backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;

use riptide_protocol::{Version, WriteOperation};

use crate::error::{ClientError, ClientResult};
use crate::refs::{DocumentRef, DocumentSnapshot, SnapshotMetadata};
use crate::ClientInner;

const MAX_ATTEMPTS: u32 = 10;
const BASE_DELAY_MS: f64 = 100.0;
const MAX_DELAY_MS: f64 = 2000.0;

struct TxState {
    inner: Arc<ClientInner>,
    reads: Mutex<HashMap<String, Version>>,
    staged: Mutex<Vec<WriteOperation>>,
}

/// The handle passed to the caller's closure. Reads go straight to the
/// server (a transaction needs authoritative versions, not cached ones);
/// writes are staged and submitted together at commit.
#[derive(Clone)]
pub struct Transaction {
    state: Arc<TxState>,
}

impl Transaction {
    fn new(inner: Arc<ClientInner>) -> Self {
        Self {
            state: Arc::new(TxState {
                inner,
                reads: Mutex::new(HashMap::new()),
                staged: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn get(&self, doc: &DocumentRef) -> ClientResult<DocumentSnapshot> {
        let key = doc.path().to_string();
        match self.state.inner.transport.get(doc.path()).await {
            Ok(document) => {
                self.state.reads.lock().insert(key, document.version);
                Ok(DocumentSnapshot {
                    path: doc.path().clone(),
                    data: Some(document.data),
                    version: document.version,
                    metadata: SnapshotMetadata::default(),
                })
            }
            Err(error) if error.is_not_found() => {
                // Version 0 is the "did not exist" precondition: the commit
                // conflicts if someone creates the document in between.
                self.state.reads.lock().insert(key, 0);
                Ok(DocumentSnapshot::missing(
                    doc.path().clone(),
                    SnapshotMetadata::default(),
                ))
            }
            Err(error) => Err(error),
        }
    }

    pub fn set(&self, doc: &DocumentRef, data: Value) {
        self.stage(WriteOperation::set(doc.path().clone(), data));
    }

    pub fn update(&self, doc: &DocumentRef, patch: Value) {
        self.stage(WriteOperation::update(doc.path().clone(), patch));
    }

    pub fn delete(&self, doc: &DocumentRef) {
        self.stage(WriteOperation::delete(doc.path().clone()));
    }

    fn stage(&self, operation: WriteOperation) {
        let expected = self
            .state
            .reads
            .lock()
            .get(&operation.path().to_string())
            .copied();
        let operation = match expected {
            Some(version) => operation.with_expected_version(version),
            None => operation,
        };
        self.state.staged.lock().push(operation);
    }

    fn take_staged(&self) -> Vec<WriteOperation> {
        std::mem::take(&mut self.state.staged.lock())
    }
}

/// Full-jitter backoff: `random(0, min(100 × 1.5^attempt, 2000))` ms.
fn backoff_delay(attempt: u32) -> Duration {
    let cap = (BASE_DELAY_MS * 1.5_f64.powi(attempt as i32)).min(MAX_DELAY_MS);
    let millis = rand::thread_rng().gen_range(0.0..cap);
    Duration::from_millis(millis as u64)
}

pub(crate) async fn run_transaction<F, Fut, T>(inner: Arc<ClientInner>, body: F) -> ClientResult<T>
where
    F: Fn(Transaction) -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    for attempt in 0..MAX_ATTEMPTS {
        let tx = Transaction::new(inner.clone());
        let result = body(tx.clone()).await?;
        let staged = tx.take_staged();
        if staged.is_empty() {
            return Ok(result);
        }
        match inner.transport.batch(&staged).await {
            Ok(version) => {
                inner.absorb_committed(&staged, version)?;
                return Ok(result);
            }
            Err(error) if error.is_conflict() => {
                tracing::debug!(attempt, "transaction conflicted; retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
    Err(ClientError::TransactionConflict {
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_inside_the_jitter_envelope() {
        for attempt in 0..12 {
            let cap = (BASE_DELAY_MS * 1.5_f64.powi(attempt)).min(MAX_DELAY_MS);
            for _ in 0..50 {
                let delay = backoff_delay(attempt as u32);
                assert!(delay < Duration::from_millis(cap as u64 + 1));
            }
        }
        // The envelope is capped at two seconds regardless of attempt.
        assert!(backoff_delay(30) <= Duration::from_millis(2000));
    }
}
