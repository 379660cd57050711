//! Worker threads of transactions.
//!
//! Every transaction is confined to its own thread. The thread owns the [Transaction] and
//! processes [Command]s from a bounded queue strictly in order. While the transaction has file
//! data to send, queued commands take precedence over the next file segment, so requests like a
//! cancellation are never starved by a long transfer.
use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use spacepackets::{cfdp::TransmissionMode, util::UnsignedEnum};

use super::{
    Command, SharedStatus, StatusSnapshot, Transaction, TransactionEnv, TransactionParams,
};
use crate::{
    request::PutRequest,
    timer::{TimerScheduler, TimerSet, TimerSink, TimerToken},
    RemoteEntityConfig, TransactionId,
};

/// Delay before an expiry is posted again to a worker whose queue was full.
pub const TIMER_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction {0} has stopped")]
pub struct TransactionStopped(pub TransactionId);

pub(crate) enum TransactionKind {
    Outgoing(PutRequest),
    Incoming,
}

/// Initial conditions of a new transaction worker.
pub(crate) struct SpawnParams {
    pub id: TransactionId,
    pub remote_cfg: RemoteEntityConfig,
    pub trans_mode: TransmissionMode,
    pub env: TransactionEnv,
    pub status: Arc<SharedStatus>,
    pub tx_allowed: bool,
    pub rx_allowed: bool,
}

/// Owner side of a transaction worker.
pub struct TransactionHandle {
    id: TransactionId,
    remote_id: u64,
    sender: SyncSender<Command>,
    status: Arc<SharedStatus>,
    thread: Option<JoinHandle<()>>,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn remote_id(&self) -> u64 {
        self.remote_id
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.load()
    }

    /// Queues a command, blocking while the queue is full.
    pub fn send(&self, command: Command) -> Result<(), TransactionStopped> {
        self.sender
            .send(command)
            .map_err(|_| TransactionStopped(self.id))
    }

    /// Waits for the worker thread to finish. The worker finishes once the transaction is
    /// disposed.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("worker of transaction {} panicked", self.id);
            }
        }
    }
}

impl core::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("status", &self.status.load())
            .finish()
    }
}

/// Creates the transaction and moves it onto a new worker thread. The transaction is not
/// activated, the first command should be [Command::Activate].
pub(crate) fn spawn(
    params: SpawnParams,
    kind: TransactionKind,
) -> std::io::Result<TransactionHandle> {
    let (sender, receiver) = mpsc::sync_channel(params.env.local_cfg.transaction_queue_capacity);
    let sink = timer_sink(sender.clone(), params.env.scheduler.clone());
    let timers = TimerSet::new(params.env.scheduler.clone(), sink);
    let id = params.id;
    let remote_id = params.remote_cfg.entity_id.value();
    let status = params.status.clone();
    let transaction_params = TransactionParams::new(
        params.id,
        params.remote_cfg,
        params.trans_mode,
        params.env,
        timers,
        params.status,
        params.tx_allowed,
        params.rx_allowed,
    );
    let transaction = match kind {
        TransactionKind::Outgoing(put) => Transaction::new_outgoing(transaction_params, put),
        TransactionKind::Incoming => Transaction::new_incoming(transaction_params),
    };
    let thread = std::thread::Builder::new()
        .name(format!("cfdp-{}", id))
        .spawn(move || run(transaction, receiver))?;
    Ok(TransactionHandle {
        id,
        remote_id,
        sender,
        status,
        thread: Some(thread),
    })
}

/// Posts expired timers into the queue of the worker. The scheduler is shared by all
/// transactions and must never block on a busy worker.
fn timer_sink(sender: SyncSender<Command>, scheduler: Arc<dyn TimerScheduler>) -> TimerSink {
    Arc::new(move |token| post_expiry(sender.clone(), scheduler.clone(), token))
}

fn post_expiry(sender: SyncSender<Command>, scheduler: Arc<dyn TimerScheduler>, token: TimerToken) {
    match sender.try_send(Command::TimerFired(token)) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => (),
        Err(TrySendError::Full(_)) => {
            log::warn!("transaction queue full, deferring {:?} timer expiry", token.role);
            let retry_scheduler = scheduler.clone();
            scheduler.schedule(
                TIMER_RETRY_DELAY,
                Box::new(move || post_expiry(sender, retry_scheduler, token)),
            );
        }
    }
}

fn run(mut transaction: Transaction, receiver: Receiver<Command>) {
    log::debug!("transaction {}: worker started", transaction.id());
    while !transaction.is_disposed() {
        if transaction.has_pending_work() {
            match receiver.try_recv() {
                Ok(command) => transaction.handle(command),
                Err(TryRecvError::Empty) => transaction.pump(),
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match receiver.recv() {
                Ok(command) => transaction.handle(command),
                Err(_) => break,
            }
        }
    }
    log::debug!(
        "transaction {}: worker stopped in state {:?}",
        transaction.id(),
        transaction.state()
    );
}
