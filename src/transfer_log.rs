use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{PluginError, StoreError};
use crate::store::Store;
use crate::transfer::{Transfer, TransferRecord, TransferState};

// Bounded so that a stalled store applies backpressure instead of growing an
// unbounded queue of dirty writes.
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Copy, Default)]
struct Counters {
    incoming_fulfilled: i64,
    outgoing_fulfilled: i64,
    incoming_prepared_and_fulfilled: i64,
    outgoing_prepared_and_fulfilled: i64,
}

struct State {
    maximum: i64,
    minimum: i64,
    counters: Counters,
    cache: HashMap<Uuid, TransferRecord>,
}

struct WriteOp {
    key: String,
    value: Option<String>,
    done: oneshot::Sender<Result<(), StoreError>>,
}

struct Persistence {
    store: Arc<dyn Store>,
    tx: Mutex<Option<mpsc::Sender<WriteOp>>>,
    rx: Mutex<Option<mpsc::Receiver<WriteOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct LogInner {
    key_prefix: String,
    state: Mutex<State>,
    persistence: Option<Persistence>,
}

/// Authoritative ledger of transfer lifecycle and the four balance counters.
///
/// The in-memory state is the source of truth for a process lifetime. When a
/// store is attached, writes are serialized through a single worker task so
/// the committed log preserves commit order; `maximum`, `minimum` and the two
/// fulfilled counters are rehydrated on `load`, transfer records are faulted
/// in lazily.
#[derive(Clone)]
pub struct TransferLog {
    inner: Arc<LogInner>,
}

impl TransferLog {
    pub fn new(
        key_prefix: &str,
        maximum: i64,
        minimum: i64,
        store: Option<Arc<dyn Store>>,
    ) -> Self {
        let persistence = store.map(|store| {
            let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
            Persistence {
                store,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                worker: Mutex::new(None),
            }
        });
        TransferLog {
            inner: Arc::new(LogInner {
                key_prefix: key_prefix.to_string(),
                state: Mutex::new(State {
                    maximum,
                    minimum,
                    counters: Counters::default(),
                    cache: HashMap::new(),
                }),
                persistence,
            }),
        }
    }

    /// Rehydrates bounds and fulfilled counters from the store and starts the
    /// write worker. Must run before a store-backed log serves requests.
    pub async fn load(&self) -> Result<(), PluginError> {
        let persistence = match &self.inner.persistence {
            Some(persistence) => persistence,
            None => return Ok(()),
        };

        let maximum = self.read_i64(&persistence.store, "maximum").await?;
        let minimum = self.read_i64(&persistence.store, "minimum").await?;
        let incoming = self.read_i64(&persistence.store, "balance:if").await?;
        let outgoing = self.read_i64(&persistence.store, "balance:of").await?;

        let (write_maximum, write_minimum) = {
            let mut state = self.inner.state.lock();
            if let Some(maximum) = maximum {
                state.maximum = maximum;
            }
            if let Some(minimum) = minimum {
                state.minimum = minimum;
            }
            let incoming = incoming.unwrap_or(0);
            let outgoing = outgoing.unwrap_or(0);
            state.counters = Counters {
                incoming_fulfilled: incoming,
                outgoing_fulfilled: outgoing,
                // in-flight prepares do not survive a restart; their records
                // are re-counted if they are ever faulted back in
                incoming_prepared_and_fulfilled: incoming,
                outgoing_prepared_and_fulfilled: outgoing,
            };
            (
                maximum.is_none().then(|| state.maximum),
                minimum.is_none().then(|| state.minimum),
            )
        };

        if let Some(maximum) = write_maximum {
            persistence
                .store
                .put(&self.key("maximum"), maximum.to_string())
                .await?;
        }
        if let Some(minimum) = write_minimum {
            persistence
                .store
                .put(&self.key("minimum"), minimum.to_string())
                .await?;
        }

        let rx = persistence.rx.lock().take();
        if let Some(mut rx) = rx {
            let store = persistence.store.clone();
            let worker = tokio::spawn(async move {
                while let Some(op) = rx.recv().await {
                    let result = match op.value {
                        Some(value) => store.put(&op.key, value).await,
                        None => store.del(&op.key).await,
                    };
                    // the enqueuing call may have given up waiting
                    let _ = op.done.send(result);
                }
                trace!("transfer log write queue drained");
            });
            *persistence.worker.lock() = Some(worker);
        }
        Ok(())
    }

    /// Stops the write worker after the queued writes drain.
    pub async fn close(&self) {
        if let Some(persistence) = &self.inner.persistence {
            persistence.tx.lock().take();
            let worker = persistence.worker.lock().take();
            if let Some(worker) = worker {
                let _ = worker.await;
            }
        }
    }

    /// Records a new transfer, enforcing the directional balance bound.
    /// Preparing an identical transfer twice is a no-op; a differing transfer
    /// under the same id is refused.
    pub async fn prepare(
        &self,
        transfer: &Transfer,
        is_incoming: bool,
    ) -> Result<(), PluginError> {
        let amount = signed_amount(transfer)?;
        self.ensure_cached(transfer.id).await?;

        let record = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if let Some(existing) = state.cache.get(&transfer.id) {
                return if existing.transfer == *transfer && existing.is_incoming == is_incoming {
                    trace!("transfer {} already prepared, ignoring duplicate", transfer.id);
                    Ok(())
                } else {
                    Err(PluginError::DuplicateId(transfer.id))
                };
            }

            let counters = &mut state.counters;
            if is_incoming {
                let new = counters
                    .incoming_prepared_and_fulfilled
                    .checked_add(amount)
                    .ok_or_else(|| balance_overflow(transfer.id))?;
                if i128::from(new) - i128::from(counters.outgoing_fulfilled)
                    > i128::from(state.maximum)
                {
                    return Err(PluginError::NotAccepted(format!(
                        "incoming transfer {} of {} would exceed maximum balance of {}",
                        transfer.id, amount, state.maximum
                    )));
                }
                counters.incoming_prepared_and_fulfilled = new;
            } else {
                let new = counters
                    .outgoing_prepared_and_fulfilled
                    .checked_add(amount)
                    .ok_or_else(|| balance_overflow(transfer.id))?;
                if i128::from(new) - i128::from(counters.incoming_fulfilled)
                    > -i128::from(state.minimum)
                {
                    return Err(PluginError::InsufficientBalance(format!(
                        "outgoing transfer {} of {} would drop balance below minimum of {}",
                        transfer.id, amount, state.minimum
                    )));
                }
                counters.outgoing_prepared_and_fulfilled = new;
            }

            let record = TransferRecord::new(transfer.clone(), is_incoming);
            state.cache.insert(transfer.id, record.clone());
            record
        };

        debug!(
            "prepared {} transfer {} for {}",
            direction(is_incoming),
            transfer.id,
            transfer.amount
        );
        self.persist_record(&record).await
    }

    /// Moves a prepared transfer to fulfilled and credits the directional
    /// fulfilled counter.
    pub async fn fulfill(
        &self,
        id: Uuid,
        fulfillment: [u8; 32],
    ) -> Result<TransferRecord, PluginError> {
        self.ensure_cached(id).await?;

        let (record, balance_suffix, balance_value) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let record = state
                .cache
                .get_mut(&id)
                .ok_or(PluginError::TransferNotFound(id))?;
            require_prepared(record, id)?;

            let amount = signed_amount(&record.transfer)?;
            let (suffix, value) = if record.is_incoming {
                state.counters.incoming_fulfilled = state
                    .counters
                    .incoming_fulfilled
                    .checked_add(amount)
                    .ok_or_else(|| balance_overflow(id))?;
                ("balance:if", state.counters.incoming_fulfilled)
            } else {
                state.counters.outgoing_fulfilled = state
                    .counters
                    .outgoing_fulfilled
                    .checked_add(amount)
                    .ok_or_else(|| balance_overflow(id))?;
                ("balance:of", state.counters.outgoing_fulfilled)
            };
            record.state = TransferState::Fulfilled;
            record.fulfillment = Some(fulfillment);
            (record.clone(), suffix, value)
        };

        debug!(
            "fulfilled {} transfer {}",
            direction(record.is_incoming),
            id
        );
        self.persist_record(&record).await?;
        self.enqueue(self.key(balance_suffix), Some(balance_value.to_string()))
            .await?;
        Ok(record)
    }

    /// Moves a prepared transfer to cancelled and releases its reservation
    /// from the directional prepared-and-fulfilled counter.
    pub async fn cancel(&self, id: Uuid) -> Result<TransferRecord, PluginError> {
        self.ensure_cached(id).await?;

        let record = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let record = state
                .cache
                .get_mut(&id)
                .ok_or(PluginError::TransferNotFound(id))?;
            require_prepared(record, id)?;

            let amount = signed_amount(&record.transfer)?;
            if record.is_incoming {
                state.counters.incoming_prepared_and_fulfilled -= amount;
            } else {
                state.counters.outgoing_prepared_and_fulfilled -= amount;
            }
            record.state = TransferState::Cancelled;
            record.clone()
        };

        debug!(
            "cancelled {} transfer {}",
            direction(record.is_incoming),
            id
        );
        self.persist_record(&record).await?;
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<TransferRecord, PluginError> {
        self.ensure_cached(id).await?;
        self.inner
            .state
            .lock()
            .cache
            .get(&id)
            .cloned()
            .ok_or(PluginError::TransferNotFound(id))
    }

    pub fn balance(&self) -> i64 {
        let state = self.inner.state.lock();
        state.counters.incoming_fulfilled - state.counters.outgoing_fulfilled
    }

    pub fn maximum(&self) -> i64 {
        self.inner.state.lock().maximum
    }

    pub fn minimum(&self) -> i64 {
        self.inner.state.lock().minimum
    }

    pub fn incoming_fulfilled(&self) -> i64 {
        self.inner.state.lock().counters.incoming_fulfilled
    }

    pub fn outgoing_fulfilled(&self) -> i64 {
        self.inner.state.lock().counters.outgoing_fulfilled
    }

    pub fn incoming_fulfilled_and_prepared(&self) -> i64 {
        self.inner.state.lock().counters.incoming_prepared_and_fulfilled
    }

    pub fn outgoing_fulfilled_and_prepared(&self) -> i64 {
        self.inner.state.lock().counters.outgoing_prepared_and_fulfilled
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}tl:{}", self.inner.key_prefix, suffix)
    }

    fn record_key(&self, id: Uuid) -> String {
        self.key(&format!("transfer:{}", id))
    }

    async fn read_i64(
        &self,
        store: &Arc<dyn Store>,
        suffix: &str,
    ) -> Result<Option<i64>, PluginError> {
        let value = store.get(&self.key(suffix)).await?;
        match value {
            Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
                StoreError(format!("corrupt value for {}: {:?}", self.key(suffix), value)).into()
            }),
            None => Ok(None),
        }
    }

    /// Faults a record in from the store. A prepared record re-enters the
    /// directional prepared counter so the balance bound keeps seeing it.
    async fn ensure_cached(&self, id: Uuid) -> Result<(), PluginError> {
        if self.inner.state.lock().cache.contains_key(&id) {
            return Ok(());
        }
        let persistence = match &self.inner.persistence {
            Some(persistence) => persistence,
            None => return Ok(()),
        };
        let json = match persistence.store.get(&self.record_key(id)).await? {
            Some(json) => json,
            None => return Ok(()),
        };
        let record: TransferRecord = serde_json::from_str(&json)
            .map_err(|err| StoreError(format!("corrupt record for {}: {}", id, err)))?;

        let mut state = self.inner.state.lock();
        let state = &mut *state;
        if !state.cache.contains_key(&id) {
            if record.state == TransferState::Prepared {
                let amount = signed_amount(&record.transfer)?;
                if record.is_incoming {
                    state.counters.incoming_prepared_and_fulfilled += amount;
                } else {
                    state.counters.outgoing_prepared_and_fulfilled += amount;
                }
            }
            state.cache.insert(id, record);
        }
        Ok(())
    }

    async fn persist_record(&self, record: &TransferRecord) -> Result<(), PluginError> {
        if self.inner.persistence.is_none() {
            return Ok(());
        }
        let json = serde_json::to_string(record)
            .map_err(|err| StoreError(format!("cannot serialize record: {}", err)))?;
        self.enqueue(self.record_key(record.transfer.id), Some(json))
            .await
    }

    async fn enqueue(&self, key: String, value: Option<String>) -> Result<(), PluginError> {
        let persistence = match &self.inner.persistence {
            Some(persistence) => persistence,
            None => return Ok(()),
        };
        let tx = persistence.tx.lock().clone();
        let tx = tx.ok_or_else(|| StoreError("write queue closed".to_string()))?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(WriteOp {
            key,
            value,
            done: done_tx,
        })
        .await
        .map_err(|_| StoreError("write queue closed".to_string()))?;
        match done_rx.await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("write worker dropped a completion");
                Err(StoreError("write worker stopped".to_string()).into())
            }
        }
    }
}

fn signed_amount(transfer: &Transfer) -> Result<i64, PluginError> {
    let amount = transfer.parsed_amount()?;
    i64::try_from(amount)
        .map_err(|_| PluginError::InvalidFields(format!("amount out of range: {}", amount)))
}

fn balance_overflow(id: Uuid) -> PluginError {
    PluginError::InvalidFields(format!("balance overflow preparing transfer {}", id))
}

fn require_prepared(record: &TransferRecord, id: Uuid) -> Result<(), PluginError> {
    match record.state {
        TransferState::Prepared => Ok(()),
        TransferState::Fulfilled => Err(PluginError::AlreadyFulfilled(id)),
        TransferState::Cancelled => Err(PluginError::AlreadyRolledBack(id)),
    }
}

fn direction(is_incoming: bool) -> &'static str {
    if is_incoming {
        "incoming"
    } else {
        "outgoing"
    }
}
