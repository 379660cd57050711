//! The CFDP entity.
//!
//! An [Entity] owns all live transactions of the local entity. Requests, received PDUs and
//! reachability windows are posted as events to the entity worker thread, which creates
//! transactions, demultiplexes PDUs to them and keeps the transaction registry. Indications are
//! published to the subscribers on the notifier thread.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

use hashbrown::HashMap;
use spacepackets::{
    cfdp::{Direction, TransactionStatus, TransmissionMode},
    util::{UnsignedByteField, UnsignedByteFieldU64, UnsignedEnum},
};

use crate::{
    filestore::VirtualFilestore,
    pdu::{Pdu, PduPayload},
    request::{PutRequest, Request},
    segmenter::SegmentationChain,
    timer::{SchedulingClock, TimerScheduler},
    transaction::{
        actor::{self, SpawnParams, TransactionHandle, TransactionKind},
        Command, SharedStatus, StatusSnapshot, TransactionEnv, TransactionEvents,
    },
    transport::{TransportBinding, TransportListener},
    user::{Indication, IndicationSubscriber, Notifier},
    ConditionCode, LocalEntityConfig, RemoteEntityConfig, RemoteEntityConfigProvider,
    TransactionId, TransactionState,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EntityError {
    #[error("entity was disposed")]
    Disposed,
    #[error("no configuration for remote entity {0}")]
    UnknownRemoteEntity(u64),
    #[error("no transport binding serves remote entity {0}")]
    NoRoute(u64),
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("entity worker has stopped")]
    QueueClosed,
    #[error("spawning a worker thread failed: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type RemoteConfigs = Box<dyn RemoteEntityConfigProvider + Send + Sync>;

enum Event {
    Put(TransactionId, PutRequest, Arc<SharedStatus>),
    Forward(TransactionId, Command),
    Pdu(Pdu),
    Window {
        remote_id: u64,
        tx: Option<bool>,
        rx: Option<bool>,
    },
    Terminated(TransactionId),
    Disposed(TransactionId),
    Dispose(mpsc::Sender<()>),
    #[cfg(test)]
    Barrier(mpsc::Sender<()>),
    Shutdown,
}

/// State shared between the entity handle and the worker threads.
struct Shared {
    local_cfg: Arc<LocalEntityConfig>,
    remote_cfgs: RwLock<RemoteConfigs>,
    transports: Vec<Arc<dyn TransportBinding>>,
    statuses: RwLock<HashMap<TransactionId, Arc<SharedStatus>>>,
    notifier: Notifier,
    disposed: AtomicBool,
}

impl Shared {
    fn remote_cfg(&self, remote_id: u64) -> Option<RemoteEntityConfig> {
        self.remote_cfgs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(remote_id)
            .copied()
    }

    fn transport(&self, remote_id: u64) -> Option<Arc<dyn TransportBinding>> {
        self.transports
            .iter()
            .find(|transport| transport.serves(remote_id))
            .cloned()
    }

    fn register_status(&self, id: TransactionId, status: Arc<SharedStatus>) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, status);
    }

    fn unregister_status(&self, id: &TransactionId) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

/// Receives the transaction lifecycle events and the transport events, and posts them to the
/// entity worker.
struct EventSink {
    sender: mpsc::Sender<Event>,
    shared: Arc<Shared>,
}

impl EventSink {
    fn post(&self, event: Event) {
        if self.sender.send(event).is_err() {
            log::debug!("entity worker stopped, dropping event");
        }
    }
}

impl TransactionEvents for EventSink {
    fn indication(&self, indication: Indication) {
        self.shared.notifier.notify(indication);
    }

    fn terminated(&self, id: TransactionId, _state: TransactionState) {
        self.post(Event::Terminated(id));
    }

    fn disposed(&self, id: TransactionId) {
        self.post(Event::Disposed(id));
    }
}

impl TransportListener for EventSink {
    fn indication(&self, pdu: Pdu) {
        self.post(Event::Pdu(pdu));
    }

    fn start_tx_period(&self, remote_id: u64) {
        self.post(Event::Window {
            remote_id,
            tx: Some(true),
            rx: None,
        });
    }

    fn end_tx_period(&self, remote_id: u64) {
        self.post(Event::Window {
            remote_id,
            tx: Some(false),
            rx: None,
        });
    }

    fn start_rx_period(&self, remote_id: u64) {
        self.post(Event::Window {
            remote_id,
            tx: None,
            rx: Some(true),
        });
    }

    fn end_rx_period(&self, remote_id: u64) {
        self.post(Event::Window {
            remote_id,
            tx: None,
            rx: Some(false),
        });
    }
}

struct Entry {
    handle: TransactionHandle,
    terminal: bool,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    tx: bool,
    rx: bool,
}

impl Default for Window {
    fn default() -> Self {
        Self { tx: true, rx: true }
    }
}

/// The entity worker. All registry state is confined to its thread.
struct Worker {
    shared: Arc<Shared>,
    events: Arc<EventSink>,
    filestore: Arc<dyn VirtualFilestore>,
    segmentation: Arc<SegmentationChain>,
    scheduler: Arc<dyn TimerScheduler>,
    transactions: HashMap<TransactionId, Entry>,
    windows: HashMap<u64, Window>,
    disposed: bool,
}

impl Worker {
    fn run(mut self, receiver: mpsc::Receiver<Event>) {
        while let Ok(event) = receiver.recv() {
            match event {
                Event::Put(id, put, status) => self.put(id, put, status),
                Event::Forward(id, command) => self.forward(id, command),
                Event::Pdu(pdu) => self.indication(pdu),
                Event::Window { remote_id, tx, rx } => self.update_window(remote_id, tx, rx),
                Event::Terminated(id) => {
                    if let Some(entry) = self.transactions.get_mut(&id) {
                        entry.terminal = true;
                    }
                }
                Event::Disposed(id) => {
                    if let Some(mut entry) = self.transactions.remove(&id) {
                        entry.handle.join();
                    }
                    self.shared.unregister_status(&id);
                }
                Event::Dispose(done) => {
                    self.dispose();
                    let _ = done.send(());
                }
                #[cfg(test)]
                Event::Barrier(done) => {
                    let _ = done.send(());
                }
                Event::Shutdown => break,
            }
        }
        self.dispose();
        log::debug!("entity {} worker stopped", self.shared.local_cfg.id.value());
    }

    fn env(&self, transport: Arc<dyn TransportBinding>) -> TransactionEnv {
        TransactionEnv::new(
            self.shared.local_cfg.clone(),
            transport,
            self.filestore.clone(),
            self.segmentation.clone(),
            self.scheduler.clone(),
            self.events.clone(),
        )
    }

    fn spawn(
        &mut self,
        id: TransactionId,
        remote_cfg: RemoteEntityConfig,
        trans_mode: TransmissionMode,
        status: Arc<SharedStatus>,
        kind: TransactionKind,
    ) -> Option<&TransactionHandle> {
        let remote_id = remote_cfg.entity_id.value();
        let Some(transport) = self.shared.transport(remote_id) else {
            log::error!("no transport binding serves remote entity {}", remote_id);
            return None;
        };
        let window = self.windows.get(&remote_id).copied().unwrap_or_default();
        let params = SpawnParams {
            id,
            remote_cfg,
            trans_mode,
            env: self.env(transport),
            status: status.clone(),
            tx_allowed: window.tx,
            rx_allowed: window.rx,
        };
        match actor::spawn(params, kind) {
            Ok(handle) => {
                self.shared.register_status(id, status);
                log::info!("transaction {} created", id);
                self.transactions.insert(
                    id,
                    Entry {
                        handle,
                        terminal: false,
                    },
                );
                self.transactions.get(&id).map(|entry| &entry.handle)
            }
            Err(e) => {
                log::error!("spawning the worker of transaction {} failed: {}", id, e);
                None
            }
        }
    }

    fn put(&mut self, id: TransactionId, put: PutRequest, status: Arc<SharedStatus>) {
        if self.disposed {
            log::warn!("entity disposed, dropping put request {}", id);
            self.shared.unregister_status(&id);
            return;
        }
        let remote_id = put.destination_id.value();
        let Some(remote_cfg) = self.shared.remote_cfg(remote_id) else {
            log::error!("no configuration for remote entity {}", remote_id);
            self.shared.unregister_status(&id);
            return;
        };
        let trans_mode = put.trans_mode_or_default(&remote_cfg);
        match self.spawn(
            id,
            remote_cfg,
            trans_mode,
            status,
            TransactionKind::Outgoing(put),
        ) {
            Some(handle) => {
                let _ = handle.send(Command::Activate);
            }
            None => self.shared.unregister_status(&id),
        }
    }

    fn forward(&mut self, id: TransactionId, command: Command) {
        match self.transactions.get(&id) {
            Some(entry) => {
                if let Err(e) = entry.handle.send(command) {
                    log::warn!("{}", e);
                }
            }
            None => log::error!("no transaction {}, dropping {:?}", id, command),
        }
    }

    /// Demultiplexes a received PDU.
    fn indication(&mut self, pdu: Pdu) {
        if self.disposed {
            log::debug!("entity disposed, dropping {}", pdu);
            return;
        }
        let id = pdu.transaction_id();
        if let Some(entry) = self.transactions.get(&id) {
            if entry.terminal && pdu.requires_ack() {
                self.reply_ack(&pdu, TransactionStatus::Terminated);
                return;
            }
            // Terminal transactions still need the ACKs of their own closing PDUs.
            if let Err(e) = entry.handle.send(Command::Indication(pdu)) {
                log::warn!("{}", e);
            }
            return;
        }
        if pdu.requires_ack() && matches!(pdu.payload, PduPayload::Finished(_)) {
            self.reply_ack(&pdu, TransactionStatus::Undefined);
            return;
        }
        let local_id = self.shared.local_cfg.id.value();
        let starts_transaction = pdu.header.direction == Direction::TowardsReceiver
            && matches!(
                pdu.payload,
                PduPayload::Metadata(_) | PduPayload::FileData(_) | PduPayload::Eof(_)
            );
        if !starts_transaction || pdu.header.dest_id.value() != local_id {
            log::warn!("dropping {} of unknown transaction {}", pdu, id);
            return;
        }
        let remote_id = pdu.header.source_id.value();
        let Some(remote_cfg) = self.shared.remote_cfg(remote_id) else {
            log::warn!(
                "dropping {}: no configuration for remote entity {}",
                pdu,
                remote_id
            );
            return;
        };
        let trans_mode = pdu.header.trans_mode;
        let status = Arc::new(SharedStatus::default());
        if let Some(handle) = self.spawn(
            id,
            remote_cfg,
            trans_mode,
            status,
            TransactionKind::Incoming,
        ) {
            let _ = handle.send(Command::Activate);
            let _ = handle.send(Command::Indication(pdu));
        }
    }

    fn reply_ack(&self, pdu: &Pdu, transaction_status: TransactionStatus) {
        let remote_id = pdu.header.sending_entity().value();
        let (Some(ack), Some(transport)) = (
            pdu.ack_reply(transaction_status),
            self.shared.transport(remote_id),
        ) else {
            log::warn!("cannot acknowledge {}", pdu);
            return;
        };
        log::debug!("acknowledging {} with {:?}", pdu, transaction_status);
        if let Err(e) = transport.send(&ack, remote_id) {
            log::error!("sending {} failed: {}", ack, e);
        }
    }

    fn update_window(&mut self, remote_id: u64, tx: Option<bool>, rx: Option<bool>) {
        let window = self.windows.entry(remote_id).or_default();
        if let Some(tx) = tx {
            window.tx = tx;
        }
        if let Some(rx) = rx {
            window.rx = rx;
        }
        log::info!(
            "remote entity {}: transmission {}, reception {}",
            remote_id,
            if window.tx { "open" } else { "closed" },
            if window.rx { "open" } else { "closed" }
        );
        for entry in self
            .transactions
            .values()
            .filter(|entry| entry.handle.remote_id() == remote_id)
        {
            let mut commands = tx
                .map(Command::TxOpportunity)
                .into_iter()
                .chain(rx.map(Command::RxOpportunity));
            if let Err(e) = commands.try_for_each(|command| entry.handle.send(command)) {
                log::warn!("{}", e);
            }
        }
    }

    /// Cancels every running transaction, disposes all transactions and clears the registry.
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        log::info!(
            "disposing entity {} with {} transactions",
            self.shared.local_cfg.id.value(),
            self.transactions.len()
        );
        for entry in self.transactions.values() {
            if !entry.terminal {
                let _ = entry
                    .handle
                    .send(Command::Cancel(ConditionCode::CancelRequestReceived));
            }
            let _ = entry.handle.send(Command::Dispose);
        }
        for (id, mut entry) in self.transactions.drain() {
            entry.handle.join();
            self.shared.unregister_status(&id);
        }
        self.shared.notifier.notify(Indication::EntityDisposed);
    }
}

/// A local CFDP entity.
///
/// Dropping the entity disposes it and stops all of its threads.
pub struct Entity {
    shared: Arc<Shared>,
    sender: Mutex<mpsc::Sender<Event>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    clock: Option<Arc<SchedulingClock>>,
    seq_num: AtomicU64,
}

impl Entity {
    /// Creates the entity and its worker, clock and notifier threads, and subscribes to all
    /// transport bindings.
    pub fn new(
        local_cfg: LocalEntityConfig,
        remote_cfgs: impl RemoteEntityConfigProvider + Send + Sync + 'static,
        transports: Vec<Arc<dyn TransportBinding>>,
        filestore: Arc<dyn VirtualFilestore>,
        segmentation: SegmentationChain,
    ) -> Result<Self, EntityError> {
        let clock = Arc::new(SchedulingClock::new()?);
        Self::with_scheduler(
            local_cfg,
            remote_cfgs,
            transports,
            filestore,
            segmentation,
            clock.clone(),
            Some(clock),
        )
    }

    fn with_scheduler(
        local_cfg: LocalEntityConfig,
        remote_cfgs: impl RemoteEntityConfigProvider + Send + Sync + 'static,
        transports: Vec<Arc<dyn TransportBinding>>,
        filestore: Arc<dyn VirtualFilestore>,
        segmentation: SegmentationChain,
        scheduler: Arc<dyn TimerScheduler>,
        clock: Option<Arc<SchedulingClock>>,
    ) -> Result<Self, EntityError> {
        let local_id = local_cfg.id.value();
        let notifier = Notifier::new(&format!("cfdp-notifier-{}", local_id))?;
        let shared = Arc::new(Shared {
            local_cfg: Arc::new(local_cfg),
            remote_cfgs: RwLock::new(Box::new(remote_cfgs)),
            transports,
            statuses: RwLock::new(HashMap::new()),
            notifier,
            disposed: AtomicBool::new(false),
        });
        let (sender, receiver) = mpsc::channel();
        let events = Arc::new(EventSink {
            sender: sender.clone(),
            shared: shared.clone(),
        });
        for transport in &shared.transports {
            transport.subscribe(events.clone());
        }
        let worker = Worker {
            shared: shared.clone(),
            events,
            filestore,
            segmentation: Arc::new(segmentation),
            scheduler,
            transactions: HashMap::new(),
            windows: HashMap::new(),
            disposed: false,
        };
        let worker = std::thread::Builder::new()
            .name(format!("cfdp-entity-{}", local_id))
            .spawn(move || worker.run(receiver))?;
        log::info!("entity {} started", local_id);
        Ok(Self {
            shared,
            sender: Mutex::new(sender),
            worker: Mutex::new(Some(worker)),
            clock,
            seq_num: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> UnsignedByteField {
        self.shared.local_cfg.id
    }

    pub fn local_cfg(&self) -> &LocalEntityConfig {
        &self.shared.local_cfg
    }

    pub fn subscribe(&self, subscriber: Box<dyn IndicationSubscriber>) {
        self.shared.notifier.subscribe(subscriber);
    }

    /// Replaces or adds the configuration of a remote entity. Running transactions keep the
    /// configuration they were created with.
    pub fn update_remote_config(&self, cfg: RemoteEntityConfig) {
        let mut remote_cfgs = self
            .shared
            .remote_cfgs
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match remote_cfgs.get_mut(cfg.entity_id.value()) {
            Some(existing) => *existing = cfg,
            None => {
                if !remote_cfgs.add_config(&cfg) {
                    log::warn!(
                        "configuration of remote entity {} was not accepted",
                        cfg.entity_id.value()
                    );
                }
            }
        }
    }

    fn post(&self, event: Event) -> Result<(), EntityError> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(event)
            .map_err(|_| EntityError::QueueClosed)
    }

    /// Queues a request. Returns the ID of the transaction the request refers to, which is a new
    /// transaction for [Request::Put].
    pub fn request(&self, request: Request) -> Result<TransactionId, EntityError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(EntityError::Disposed);
        }
        let (id, command) = match request {
            Request::Put(put) => return self.put(put),
            Request::Cancel(id) => (id, Command::Cancel(ConditionCode::CancelRequestReceived)),
            Request::Suspend(id) => (id, Command::Suspend),
            Request::Resume(id) => (id, Command::Resume),
            Request::Report(id) => (id, Command::Report),
            Request::KeepAlive(id) => (id, Command::KeepAlive),
            Request::PromptNak(id) => (id, Command::PromptNak),
        };
        if self.transaction_status(id).is_none() {
            log::error!("request {:?} for unknown transaction {}", command, id);
            return Err(EntityError::UnknownTransaction(id));
        }
        self.post(Event::Forward(id, command))?;
        Ok(id)
    }

    /// Starts a new outgoing transaction.
    pub fn put(&self, put: PutRequest) -> Result<TransactionId, EntityError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(EntityError::Disposed);
        }
        let remote_id = put.destination_id.value();
        if remote_id == self.shared.local_cfg.id.value() {
            return Err(EntityError::InvalidRequest(
                "the destination is the local entity",
            ));
        }
        if self.shared.remote_cfg(remote_id).is_none() {
            return Err(EntityError::UnknownRemoteEntity(remote_id));
        }
        if self.shared.transport(remote_id).is_none() {
            return Err(EntityError::NoRoute(remote_id));
        }
        let seq_num = self.seq_num.fetch_add(1, Ordering::Relaxed);
        let id = TransactionId::new(
            self.shared.local_cfg.id,
            UnsignedByteFieldU64::new(seq_num).into(),
        );
        let status = Arc::new(SharedStatus::default());
        self.shared.register_status(id, status.clone());
        log::info!("put request {} to entity {}", id, remote_id);
        self.post(Event::Put(id, put, status))?;
        Ok(id)
    }

    /// Lock-free status of a live transaction.
    pub fn transaction_status(&self, id: TransactionId) -> Option<StatusSnapshot> {
        self.shared
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|status| status.load())
    }

    /// IDs of all transactions which are not disposed yet.
    pub fn transactions(&self) -> Vec<TransactionId> {
        self.shared
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Cancels all running transactions with [ConditionCode::CancelRequestReceived], disposes
    /// them and publishes [Indication::EntityDisposed]. Subsequent requests are rejected. Calling
    /// this more than once has no effect.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done_tx, done_rx) = mpsc::channel();
        if self.post(Event::Dispose(done_tx)).is_ok() && done_rx.recv().is_err() {
            log::error!("entity worker stopped during disposal");
        }
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        self.dispose();
        let _ = self.post(Event::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("entity worker panicked");
            }
        }
        self.shared.notifier.shutdown();
        if let Some(clock) = &self.clock {
            clock.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use spacepackets::cfdp::{
        pdu::{
            finished::{DeliveryCode, FileStatus},
            FileDirectiveType,
        },
        ChecksumType, SegmentationControl,
    };

    use super::*;
    use crate::{
        filestore::NativeFilestore,
        pdu::{tests::header, AckPdu, EofPdu, FinishedPdu, KeepAlivePdu, MetadataPdu},
        tests::{basic_remote_cfg, basic_remote_cfg_table, LOCAL_ID, REMOTE_ID},
        timer::ManualScheduler,
        transport::tests::RecordingTransport,
        user::channel_subscriber,
        FaultHandlerMap, IndicationConfig,
    };

    struct Fixture {
        entity: Entity,
        transport: Arc<RecordingTransport>,
        indications: mpsc::Receiver<Indication>,
        tmpdir: tempfile::TempDir,
    }

    fn fixture(trans_mode: TransmissionMode) -> Fixture {
        let tmpdir = tempfile::tempdir().unwrap();
        let local_cfg = LocalEntityConfig::new(
            LOCAL_ID.into(),
            IndicationConfig::default(),
            FaultHandlerMap::default(),
        )
        .with_staging_dir(tmpdir.path());
        let transport = Arc::new(RecordingTransport::default());
        let entity = Entity::with_scheduler(
            local_cfg,
            basic_remote_cfg_table(REMOTE_ID, trans_mode),
            vec![transport.clone() as Arc<dyn TransportBinding>],
            Arc::new(NativeFilestore::default()),
            SegmentationChain::default(),
            Arc::new(ManualScheduler::default()),
            None,
        )
        .unwrap();
        let (tx, indications) = mpsc::channel();
        entity.subscribe(channel_subscriber(tx));
        Fixture {
            entity,
            transport,
            indications,
            tmpdir,
        }
    }

    impl Fixture {
        fn inject(&self, pdu: Pdu) {
            self.entity.post(Event::Pdu(pdu)).unwrap();
        }

        /// Returns once the entity worker processed all previously posted events.
        fn barrier(&self) {
            let (tx, rx) = mpsc::channel();
            self.entity.post(Event::Barrier(tx)).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        fn window(&self, tx: Option<bool>, rx: Option<bool>) {
            self.entity
                .post(Event::Window {
                    remote_id: REMOTE_ID.value(),
                    tx,
                    rx,
                })
                .unwrap();
        }

        /// Disposal is published before the entity removes the transaction.
        fn wait_removed(&self, id: TransactionId) {
            for _ in 0..500 {
                if self.entity.transaction_status(id).is_none() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("transaction {} was not removed", id);
        }

        fn next_indication(&self) -> Indication {
            self.indications
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
        }

        fn wait_for(&self, mut predicate: impl FnMut(&Indication) -> bool) -> Indication {
            loop {
                let indication = self.next_indication();
                if predicate(&indication) {
                    return indication;
                }
            }
        }

        fn wait_sent(&self, count: usize) -> Vec<Pdu> {
            let mut sent = Vec::new();
            for _ in 0..500 {
                sent.extend(self.transport.take());
                if sent.len() >= count {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            sent
        }
    }

    fn incoming_pdu(payload: PduPayload) -> Pdu {
        let mut header = header(TransmissionMode::Acknowledged, payload.direction());
        header.source_id = REMOTE_ID.into();
        header.dest_id = LOCAL_ID.into();
        Pdu::new(header, payload)
    }

    fn empty_eof() -> EofPdu {
        EofPdu {
            condition_code: ConditionCode::NoError,
            checksum: 0,
            file_size: 0,
            fault_location: None,
        }
    }

    #[test]
    fn test_put_validation() {
        let f = fixture(TransmissionMode::Unacknowledged);
        let put = PutRequest::new(LOCAL_ID.into(), None, None, None, None).unwrap();
        assert!(matches!(
            f.entity.put(put),
            Err(EntityError::InvalidRequest(_))
        ));
        let put = PutRequest::new(UnsignedByteFieldU64::new(99).into(), None, None, None, None)
            .unwrap();
        assert!(matches!(
            f.entity.request(Request::Put(put)),
            Err(EntityError::UnknownRemoteEntity(99))
        ));
        assert!(f.entity.transactions().is_empty());
        f.entity.update_remote_config(basic_remote_cfg(
            UnsignedByteFieldU64::new(99),
            TransmissionMode::Unacknowledged,
        ));
        let put = PutRequest::new(UnsignedByteFieldU64::new(99).into(), None, None, None, None)
            .unwrap();
        let id = f.entity.put(put).unwrap();
        assert_eq!(f.next_indication(), Indication::TransactionStarted(id));
    }

    #[test]
    fn test_request_for_unknown_transaction() {
        let f = fixture(TransmissionMode::Unacknowledged);
        let id = TransactionId::new(LOCAL_ID.into(), UnsignedByteFieldU64::new(77).into());
        for request in [
            Request::Cancel(id),
            Request::Suspend(id),
            Request::Resume(id),
            Request::Report(id),
            Request::KeepAlive(id),
            Request::PromptNak(id),
        ] {
            assert!(matches!(
                f.entity.request(request),
                Err(EntityError::UnknownTransaction(unknown)) if unknown == id
            ));
        }
    }

    #[test]
    fn test_metadata_only_put() {
        let f = fixture(TransmissionMode::Unacknowledged);
        let put = PutRequest::new(REMOTE_ID.into(), None, None, None, Some(false)).unwrap();
        let id = f.entity.request(Request::Put(put)).unwrap();
        assert_eq!(id.source_id().value(), LOCAL_ID.value());
        assert_eq!(f.next_indication(), Indication::TransactionStarted(id));
        assert_eq!(f.next_indication(), Indication::EofSent(id));
        assert!(matches!(
            f.next_indication(),
            Indication::TransactionFinished(params) if params.condition_code == ConditionCode::NoError
        ));
        assert_eq!(
            f.next_indication(),
            Indication::TransactionDisposed {
                id,
                state: TransactionState::Completed
            }
        );
        let sent = f.wait_sent(2);
        assert!(matches!(sent[0].payload, PduPayload::Metadata(_)));
        assert!(matches!(sent[1].payload, PduPayload::Eof(_)));
        f.wait_removed(id);
        // Sequence numbers are never reused.
        let put = PutRequest::new(REMOTE_ID.into(), None, None, None, Some(false)).unwrap();
        let second = f.entity.put(put).unwrap();
        assert_eq!(second.seq_num().value(), id.seq_num().value() + 1);
    }

    #[test]
    fn test_unknown_finished_acked_as_undefined() {
        let f = fixture(TransmissionMode::Acknowledged);
        let finished = FinishedPdu {
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Complete,
            file_status: FileStatus::Retained,
            fs_responses: Vec::new(),
            fault_location: None,
        };
        f.inject(Pdu::new(
            header(TransmissionMode::Acknowledged, Direction::TowardsSender),
            PduPayload::Finished(finished),
        ));
        let sent = f.wait_sent(1);
        assert_eq!(
            sent[0].payload,
            PduPayload::Ack(AckPdu {
                directive: FileDirectiveType::FinishedPdu,
                condition_code: ConditionCode::NoError,
                transaction_status: TransactionStatus::Undefined,
            })
        );
        assert_eq!(sent[0].header.direction, Direction::TowardsReceiver);
        assert!(f.entity.transactions().is_empty());
    }

    #[test]
    fn test_unknown_pdus_dropped() {
        let f = fixture(TransmissionMode::Acknowledged);
        // Keep-alive PDUs never create transactions.
        f.inject(incoming_pdu(PduPayload::KeepAlive(KeepAlivePdu {
            progress: 0,
        })));
        // Neither do PDUs addressed to another entity.
        let mut pdu = incoming_pdu(PduPayload::Eof(empty_eof()));
        pdu.header.dest_id = UnsignedByteFieldU64::new(42).into();
        f.inject(pdu);
        // Nor PDUs from entities without a configuration.
        let mut pdu = incoming_pdu(PduPayload::Eof(empty_eof()));
        pdu.header.source_id = UnsignedByteFieldU64::new(43).into();
        f.inject(pdu);
        f.barrier();
        assert!(f.entity.transactions().is_empty());
        assert!(f.transport.take().is_empty());
    }

    #[test]
    fn test_incoming_transaction_acks_closing_pdus_when_terminal() {
        let f = fixture(TransmissionMode::Acknowledged);
        let dest = f.tmpdir.path().join("dest.txt");
        let metadata = MetadataPdu {
            closure_requested: true,
            checksum_type: ChecksumType::NullChecksum as u8,
            file_size: 0,
            seg_ctrl: SegmentationControl::NoRecordBoundaryPreservation,
            source_file: Some("/src.txt".into()),
            dest_file: Some(dest.to_str().unwrap().into()),
            options: Default::default(),
        };
        f.inject(incoming_pdu(PduPayload::Metadata(metadata)));
        f.inject(incoming_pdu(PduPayload::Eof(empty_eof())));
        let Indication::MetadataReceived(params) =
            f.wait_for(|ind| matches!(ind, Indication::MetadataReceived(_)))
        else {
            unreachable!()
        };
        let id = params.id;
        assert_eq!(id.source_id().value(), REMOTE_ID.value());
        f.wait_for(|ind| matches!(ind, Indication::TransactionFinished(_)));
        // ACK of the EOF, then the Finished PDU.
        let sent = f.wait_sent(2);
        assert!(matches!(sent[0].payload, PduPayload::Ack(_)));
        assert!(matches!(sent[1].payload, PduPayload::Finished(_)));
        assert!(dest.exists());
        assert_eq!(
            f.entity.transaction_status(id).map(|status| status.state),
            Some(TransactionState::Completed)
        );
        // The transaction waits for the ACK of its Finished PDU, a repeated EOF is answered by
        // the entity.
        f.inject(incoming_pdu(PduPayload::Eof(empty_eof())));
        let sent = f.wait_sent(1);
        assert_eq!(
            sent[0].payload,
            PduPayload::Ack(AckPdu {
                directive: FileDirectiveType::EofPdu,
                condition_code: ConditionCode::NoError,
                transaction_status: TransactionStatus::Terminated,
            })
        );
        f.inject(incoming_pdu(PduPayload::Ack(AckPdu {
            directive: FileDirectiveType::FinishedPdu,
            condition_code: ConditionCode::NoError,
            transaction_status: TransactionStatus::Active,
        })));
        assert_eq!(
            f.wait_for(|ind| matches!(ind, Indication::TransactionDisposed { .. })),
            Indication::TransactionDisposed {
                id,
                state: TransactionState::Completed
            }
        );
        f.wait_removed(id);
        assert!(f.entity.transactions().is_empty());
    }

    #[test]
    fn test_dispose_cancels_running_transactions() {
        let f = fixture(TransmissionMode::Acknowledged);
        let put = PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap();
        let id = f.entity.put(put).unwrap();
        f.wait_for(|ind| matches!(ind, Indication::EofSent(_)));
        f.entity.dispose();
        f.entity.dispose();
        let mut rest = Vec::new();
        loop {
            let indication = f.next_indication();
            let done = indication == Indication::EntityDisposed;
            rest.push(indication);
            if done {
                break;
            }
        }
        assert!(rest.iter().any(|ind| matches!(
            ind,
            Indication::TransactionFinished(params)
                if params.condition_code == ConditionCode::CancelRequestReceived
        )));
        assert!(rest.contains(&Indication::TransactionDisposed {
            id,
            state: TransactionState::Cancelled
        }));
        assert_eq!(
            rest.iter()
                .filter(|ind| **ind == Indication::EntityDisposed)
                .count(),
            1
        );
        assert!(f.entity.transaction_status(id).is_none());
        let put = PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap();
        assert!(matches!(f.entity.put(put), Err(EntityError::Disposed)));
        assert!(matches!(
            f.entity.request(Request::Report(id)),
            Err(EntityError::Disposed)
        ));
    }

    #[test]
    fn test_closed_window_holds_file_data() {
        let f = fixture(TransmissionMode::Unacknowledged);
        let source = f.tmpdir.path().join("source.bin");
        std::fs::File::create(&source)
            .unwrap()
            .write_all(&[0xa5; 1000])
            .unwrap();
        let put = PutRequest::new_regular_request(
            REMOTE_ID.into(),
            source.to_str().unwrap(),
            "/tmp/dest.bin",
            None,
            Some(false),
        )
        .unwrap();
        // A transaction created while the window is closed starts frozen.
        f.window(Some(false), None);
        let id = f.entity.put(put).unwrap();
        assert_eq!(f.next_indication(), Indication::TransactionStarted(id));
        std::thread::sleep(Duration::from_millis(50));
        assert!(f.transport.take().is_empty());
        assert_eq!(f.entity.transaction_status(id).unwrap().progress, 0);
        f.window(Some(true), None);
        assert_eq!(
            f.next_indication(),
            Indication::Resumed { id, progress: 0 }
        );
        f.wait_for(|ind| matches!(ind, Indication::TransactionDisposed { .. }));
        // Metadata, eight file data PDUs and the EOF.
        let sent = f.wait_sent(10);
        assert_eq!(sent.len(), 10);
        assert!(matches!(sent[0].payload, PduPayload::Metadata(_)));
        assert!(matches!(sent[9].payload, PduPayload::Eof(_)));
    }

    #[test]
    fn test_requests_forwarded_to_transaction() {
        let f = fixture(TransmissionMode::Acknowledged);
        let put = PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap();
        let id = f.entity.put(put).unwrap();
        f.wait_for(|ind| matches!(ind, Indication::EofSent(_)));
        assert_eq!(f.entity.request(Request::Report(id)).unwrap(), id);
        let Indication::Report(report) = f.next_indication() else {
            panic!("expected a report");
        };
        assert_eq!(report.id, id);
        assert_eq!(report.state, TransactionState::Running);
        f.entity.request(Request::Suspend(id)).unwrap();
        assert_eq!(
            f.next_indication(),
            Indication::Suspended {
                id,
                condition_code: ConditionCode::SuspendRequestReceived
            }
        );
        f.entity.request(Request::Cancel(id)).unwrap();
        f.wait_for(|ind| matches!(ind, Indication::TransactionFinished(_)));
        assert_eq!(
            f.entity.transaction_status(id).unwrap().condition_code,
            ConditionCode::CancelRequestReceived
        );
    }
}
