//! CFDP transactions.
//!
//! A [Transaction] is a synchronous state machine made of the [TransactionCore], which holds the
//! state shared by both roles, and the role specific part, which is either an outgoing (sending)
//! or an incoming (receiving) transaction. The state machine is driven by [Command]s. In a running
//! entity, each transaction is confined to its own worker thread, see [actor].
//!
//! # Faults
//!
//! Protocol procedures return a [Flow]. Declaring a fault through
//! [TransactionCore::declare_fault] either continues the procedure, for ignored faults, or breaks
//! out of it with a [FaultOutcome]. The transaction executes the outcome once the procedure has
//! unwound, so a half-finished procedure never emits further PDUs.
//!
//! # Suspension and freezing
//!
//! Suspension is requested by the user or by a fault handler and changes the transaction state.
//! A transaction is frozen while the transmission or the reception window of its remote entity is
//! closed. Both stop the protocol timers and the emission of metadata, file data, NAK and
//! keep-alive PDUs. Only suspension publishes indications. Ending either runs the same resumption
//! actions.
use core::ops::ControlFlow;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use derive_new::new;
use spacepackets::{
    cfdp::{FaultHandlerCode, TransmissionMode},
    util::{UnsignedByteField, UnsignedEnum},
};

use crate::{
    fault::{FaultOutcome, Flow},
    filestore::VirtualFilestore,
    pdu::{AckPdu, Pdu, PduHeader, PduPayload},
    request::PutRequest,
    segmenter::SegmentationChain,
    timer::{PausedTimers, TimerRole, TimerScheduler, TimerSet, TimerToken},
    transport::{TransportBinding, TransportError},
    user::{Indication, TransactionReport},
    ConditionCode, EntityType, FaultHandlerMap, IndicationConfig, LocalEntityConfig,
    RemoteEntityConfig, TransactionId, TransactionState,
};

pub mod actor;
mod incoming;
mod outgoing;
pub mod reconstruction;

use incoming::IncomingTransaction;
use outgoing::OutgoingTransaction;

/// Operations of a transaction. All of them are processed strictly in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Activate,
    Indication(Pdu),
    Cancel(ConditionCode),
    Suspend,
    Resume,
    TxOpportunity(bool),
    RxOpportunity(bool),
    Report,
    KeepAlive,
    PromptNak,
    TimerFired(TimerToken),
    Dispose,
}

/// Lifecycle events of transactions, consumed by the owning entity.
pub trait TransactionEvents: Send + Sync {
    fn indication(&self, indication: Indication);
    /// The transaction entered a terminal state.
    fn terminated(&self, id: TransactionId, state: TransactionState);
    fn disposed(&self, id: TransactionId);
}

/// Collaborators of a transaction.
#[derive(Clone, new)]
pub struct TransactionEnv {
    pub local_cfg: Arc<LocalEntityConfig>,
    pub transport: Arc<dyn TransportBinding>,
    pub filestore: Arc<dyn VirtualFilestore>,
    pub segmentation: Arc<SegmentationChain>,
    pub scheduler: Arc<dyn TimerScheduler>,
    pub events: Arc<dyn TransactionEvents>,
}

/// Status of a transaction which can be read from any thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: TransactionState,
    pub condition_code: ConditionCode,
    pub progress: u64,
    pub file_size: Option<u64>,
}

const UNKNOWN_FILE_SIZE: u64 = u64::MAX;

/// Atomic mirror of the transaction status. Only the transaction writes it.
#[derive(Debug)]
pub struct SharedStatus {
    state: AtomicU8,
    condition_code: AtomicU8,
    progress: AtomicU64,
    file_size: AtomicU64,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(TransactionState::Running as u8),
            condition_code: AtomicU8::new(ConditionCode::NoError as u8),
            progress: AtomicU64::new(0),
            file_size: AtomicU64::new(UNKNOWN_FILE_SIZE),
        }
    }
}

impl SharedStatus {
    pub fn load(&self) -> StatusSnapshot {
        let file_size = self.file_size.load(Ordering::Acquire);
        StatusSnapshot {
            state: TransactionState::from_raw(self.state.load(Ordering::Acquire)),
            condition_code: ConditionCode::try_from(self.condition_code.load(Ordering::Acquire))
                .unwrap_or(ConditionCode::NoError),
            progress: self.progress.load(Ordering::Acquire),
            file_size: (file_size != UNKNOWN_FILE_SIZE).then_some(file_size),
        }
    }
}

struct PendingAck {
    pdu: Pdu,
    retries: u32,
}

/// State and machinery shared by both transaction roles.
pub(crate) struct TransactionCore {
    pub id: TransactionId,
    pub entity_type: EntityType,
    pub local_id: UnsignedByteField,
    pub remote_cfg: RemoteEntityConfig,
    pub trans_mode: TransmissionMode,
    pub fault_handlers: FaultHandlerMap,
    pub env: TransactionEnv,
    state: TransactionState,
    condition_code: ConditionCode,
    progress: u64,
    file_size: Option<u64>,
    tx_allowed: bool,
    rx_allowed: bool,
    paused: Option<PausedTimers>,
    timers: TimerSet,
    status: Arc<SharedStatus>,
    pending_ack: Option<PendingAck>,
    dispose_requested: bool,
    disposed: bool,
}

impl TransactionCore {
    pub fn is_acknowledged(&self) -> bool {
        self.trans_mode == TransmissionMode::Acknowledged
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        log::info!(
            "transaction {}: {:?} -> {:?}",
            self.id,
            self.state,
            state
        );
        self.state = state;
        self.status.state.store(state as u8, Ordering::Release);
        if state.is_terminal() {
            self.env.events.terminated(self.id, state);
        }
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn set_condition_code(&mut self, code: ConditionCode) {
        self.condition_code = code;
        self.status
            .condition_code
            .store(code as u8, Ordering::Release);
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn set_progress(&mut self, progress: u64) {
        self.progress = progress;
        self.status.progress.store(progress, Ordering::Release);
    }

    pub fn set_file_size(&mut self, file_size: u64) {
        self.file_size = Some(file_size);
        self.status.file_size.store(file_size, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        !self.tx_allowed || !self.rx_allowed
    }

    /// Whether the transaction may emit metadata, file data, NAK and keep-alive PDUs.
    pub fn may_transmit(&self) -> bool {
        self.state == TransactionState::Running && self.paused.is_none()
    }

    /// Terminal transactions only finish their closing exchange.
    pub fn in_cleanup(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn request_dispose(&mut self) {
        self.dispose_requested = true;
    }

    fn remote_id(&self) -> u64 {
        self.remote_cfg.entity_id.value()
    }

    fn header(&self, payload: &PduPayload) -> PduHeader {
        let (source_id, dest_id) = match self.entity_type {
            EntityType::Sending => (self.local_id, self.remote_cfg.entity_id),
            EntityType::Receiving => (self.remote_cfg.entity_id, self.local_id),
        };
        PduHeader {
            source_id,
            dest_id,
            seq_num: *self.id.seq_num(),
            trans_mode: self.trans_mode,
            direction: payload.direction(),
            crc_flag: self.remote_cfg.crc_on_transmission_by_default,
            large_file: self.file_size.is_some_and(|size| size > u32::MAX as u64),
        }
    }

    pub fn build_pdu(&self, payload: PduPayload) -> Pdu {
        Pdu::new(self.header(&payload), payload)
    }

    pub fn send_pdu(&self, pdu: &Pdu) -> Result<(), TransportError> {
        log::debug!("transaction {}: sending {}", self.id, pdu);
        self.env
            .transport
            .send(pdu, self.remote_id())
            .inspect_err(|e| {
                log::error!("transaction {}: sending {} failed: {}", self.id, pdu, e)
            })
    }

    pub fn send(&self, payload: PduPayload) -> Result<(), TransportError> {
        self.send_pdu(&self.build_pdu(payload))
    }

    /// Sends a PDU and applies the positive acknowledgement procedure to it. Send failures are
    /// covered by the retransmissions.
    pub fn send_acknowledged(&mut self, payload: PduPayload) -> Result<(), TransportError> {
        let pdu = self.build_pdu(payload);
        let result = self.send_pdu(&pdu);
        self.pending_ack = Some(PendingAck { pdu, retries: 0 });
        self.start_timer(
            TimerRole::PositiveAck,
            self.remote_cfg.positive_ack_timer_interval,
        );
        result
    }

    /// Returns [true] if the ACK matches the PDU which awaits acknowledgement.
    pub fn ack_received(&mut self, ack: &AckPdu) -> bool {
        let matches = self.pending_ack.as_ref().is_some_and(|pending| {
            pending.pdu.directive_type() == Some(ack.directive)
                && pending.pdu.condition_code() == Some(ack.condition_code)
        });
        if matches {
            log::debug!("transaction {}: {:?} acknowledged", self.id, ack.directive);
            self.clear_pending_ack();
        } else {
            log::debug!("transaction {}: unexpected {:?}", self.id, ack);
        }
        matches
    }

    pub fn clear_pending_ack(&mut self) {
        self.pending_ack = None;
        self.cancel_timer(TimerRole::PositiveAck);
    }

    pub fn awaiting_ack(&self) -> bool {
        self.pending_ack.is_some()
    }

    fn positive_ack_expired(&mut self) -> Flow {
        let limit = self.remote_cfg.positive_ack_timer_expiration_limit;
        let Some(pending) = self.pending_ack.as_mut() else {
            return ControlFlow::Continue(());
        };
        if pending.retries >= limit {
            return self.declare_fault(ConditionCode::PositiveAckLimitReached);
        }
        pending.retries += 1;
        log::debug!(
            "transaction {}: positive ack retry {} of {}",
            self.id,
            pending.retries,
            limit
        );
        let pdu = pending.pdu.clone();
        let _ = self.send_pdu(&pdu);
        self.start_timer(
            TimerRole::PositiveAck,
            self.remote_cfg.positive_ack_timer_interval,
        );
        ControlFlow::Continue(())
    }

    pub fn start_timer(&mut self, role: TimerRole, period: Duration) {
        match self.paused.as_mut() {
            Some(paused) => paused.insert(role, period, false),
            None => self.timers.start(role, period),
        }
    }

    pub fn start_periodic_timer(&mut self, role: TimerRole, period: Duration) {
        match self.paused.as_mut() {
            Some(paused) => paused.insert(role, period, true),
            None => self.timers.start_periodic(role, period),
        }
    }

    pub fn cancel_timer(&mut self, role: TimerRole) {
        if let Some(paused) = self.paused.as_mut() {
            paused.remove(role);
        }
        self.timers.cancel(role);
    }

    pub fn cancel_all_timers(&mut self) {
        if let Some(paused) = self.paused.as_mut() {
            *paused = PausedTimers::default();
        }
        self.timers.cancel_all();
    }

    pub fn timer_active(&self, role: TimerRole) -> bool {
        self.timers.is_armed(role)
            || self
                .paused
                .as_ref()
                .is_some_and(|paused| paused.contains(role))
    }

    /// Restarts a running timer with its full period. Paused timers restart on resumption anyway.
    pub fn restart_timer(&mut self, role: TimerRole) {
        self.timers.restart(role);
    }

    fn suspendable(&self) -> bool {
        self.is_acknowledged() || self.entity_type == EntityType::Sending
    }

    fn supervises_inactivity(&self) -> bool {
        self.is_acknowledged() || self.entity_type == EntityType::Receiving
    }

    /// Starts the inactivity timer over with its full period, also after it expired. Terminal
    /// transactions only restart a running timer.
    pub fn reset_inactivity_timer(&mut self) {
        if self.in_cleanup() {
            self.restart_timer(TimerRole::Inactivity);
        } else if self.supervises_inactivity() {
            self.start_timer(TimerRole::Inactivity, self.remote_cfg.inactivity_timeout);
        }
    }

    pub fn emit(&self, indication: Indication) {
        if indication_enabled(&self.env.local_cfg.indication_cfg, &indication) {
            self.env.events.indication(indication);
        }
    }

    /// Logs the fault and resolves the configured handler. Faults declared while the transaction
    /// is already terminal are not handled again, apart from positive ACK exhaustion and
    /// abandonment which abandon the transaction.
    pub fn declare_fault(&mut self, code: ConditionCode) -> Flow {
        let action = self.fault_handlers.get(code);
        log::warn!(
            "transaction {}: fault {:?} declared, handler {:?}",
            self.id,
            code,
            action
        );
        if self.in_cleanup() {
            if code == ConditionCode::PositiveAckLimitReached
                || action == FaultHandlerCode::AbandonTransaction
            {
                return ControlFlow::Break(FaultOutcome::Abandonment(code));
            }
            return ControlFlow::Continue(());
        }
        match action {
            FaultHandlerCode::NoticeOfSuspension if self.suspendable() => {
                ControlFlow::Break(FaultOutcome::Suspension(code))
            }
            // Unacknowledged receivers can not be suspended and carry on as if ignored.
            FaultHandlerCode::IgnoreError | FaultHandlerCode::NoticeOfSuspension => {
                self.emit(Indication::Fault {
                    id: self.id,
                    condition_code: code,
                    progress: self.progress,
                });
                ControlFlow::Continue(())
            }
            FaultHandlerCode::NoticeOfCancellation => {
                ControlFlow::Break(FaultOutcome::Cancellation(code))
            }
            FaultHandlerCode::AbandonTransaction => {
                ControlFlow::Break(FaultOutcome::Abandonment(code))
            }
        }
    }
}

fn indication_enabled(cfg: &IndicationConfig, indication: &Indication) -> bool {
    match indication {
        Indication::EofSent(_) => cfg.eof_sent,
        Indication::EofReceived(_) => cfg.eof_recv,
        Indication::FileSegmentReceived(_) => cfg.file_segment_recv,
        Indication::TransactionFinished(_) => cfg.transaction_finished,
        Indication::Suspended { .. } => cfg.suspended,
        Indication::Resumed { .. } => cfg.resumed,
        _ => true,
    }
}

/// Protocol reactions which differ between the two roles.
pub(crate) trait RoleHooks {
    fn activate(&mut self, core: &mut TransactionCore) -> Flow;

    fn indication(&mut self, core: &mut TransactionCore, pdu: Pdu) -> Flow;

    /// Expiry of every timer apart from the inactivity and positive ACK timers.
    fn timer_expired(&mut self, core: &mut TransactionCore, role: TimerRole) -> Flow;

    /// Notice of cancellation. The core already switched to [TransactionState::Cancelled].
    fn cancel(&mut self, core: &mut TransactionCore, code: ConditionCode) -> Flow;

    fn keep_alive_request(&mut self, core: &mut TransactionCore) -> Flow;

    fn prompt_nak_request(&mut self, core: &mut TransactionCore) -> Flow;

    /// Called when a suspension or a freeze ended.
    fn unpaused(&mut self, _core: &mut TransactionCore) -> Flow {
        ControlFlow::Continue(())
    }

    fn has_pending_work(&self, _core: &TransactionCore) -> bool {
        false
    }

    /// Performs one unit of pending work.
    fn pump(&mut self, _core: &mut TransactionCore) -> Flow {
        ControlFlow::Continue(())
    }

    fn file_size(&self) -> Option<u64>;

    fn pre_dispose(&mut self, core: &mut TransactionCore);
}

pub(crate) enum Role {
    Outgoing(Box<OutgoingTransaction>),
    Incoming(Box<IncomingTransaction>),
}

impl Role {
    fn hooks(&mut self) -> &mut dyn RoleHooks {
        match self {
            Role::Outgoing(outgoing) => outgoing.as_mut(),
            Role::Incoming(incoming) => incoming.as_mut(),
        }
    }

    fn hooks_ref(&self) -> &dyn RoleHooks {
        match self {
            Role::Outgoing(outgoing) => outgoing.as_ref(),
            Role::Incoming(incoming) => incoming.as_ref(),
        }
    }
}

/// Everything required to create a transaction.
#[derive(new)]
pub(crate) struct TransactionParams {
    pub id: TransactionId,
    pub remote_cfg: RemoteEntityConfig,
    pub trans_mode: TransmissionMode,
    pub env: TransactionEnv,
    pub timers: TimerSet,
    pub status: Arc<SharedStatus>,
    pub tx_allowed: bool,
    pub rx_allowed: bool,
}

pub struct Transaction {
    core: TransactionCore,
    role: Role,
}

impl TransactionCore {
    fn new(params: TransactionParams, entity_type: EntityType) -> Self {
        let local_id = params.env.local_cfg.id;
        let fault_handlers = params.env.local_cfg.fault_handlers.clone();
        let mut core = Self {
            id: params.id,
            entity_type,
            local_id,
            remote_cfg: params.remote_cfg,
            trans_mode: params.trans_mode,
            fault_handlers,
            env: params.env,
            state: TransactionState::Running,
            condition_code: ConditionCode::NoError,
            progress: 0,
            file_size: None,
            tx_allowed: params.tx_allowed,
            rx_allowed: params.rx_allowed,
            paused: None,
            timers: params.timers,
            status: params.status,
            pending_ack: None,
            dispose_requested: false,
            disposed: false,
        };
        if core.is_frozen() {
            core.paused = Some(PausedTimers::default());
        }
        core
    }
}

impl Transaction {
    pub(crate) fn new_outgoing(params: TransactionParams, put: PutRequest) -> Self {
        let mut core = TransactionCore::new(params, EntityType::Sending);
        core.fault_handlers
            .apply_overrides(put.fault_handler_overrides.iter());
        let role = Role::Outgoing(Box::new(OutgoingTransaction::new(&core, put)));
        Self { core, role }
    }

    pub(crate) fn new_incoming(params: TransactionParams) -> Self {
        let core = TransactionCore::new(params, EntityType::Receiving);
        let role = Role::Incoming(Box::new(IncomingTransaction::new(&core)));
        Self { core, role }
    }

    pub fn id(&self) -> TransactionId {
        self.core.id
    }

    pub fn state(&self) -> TransactionState {
        self.core.state
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed
    }

    pub fn has_pending_work(&self) -> bool {
        !self.core.disposed && self.role.hooks_ref().has_pending_work(&self.core)
    }

    pub fn pump(&mut self) {
        if self.core.disposed {
            return;
        }
        let flow = self.role.hooks().pump(&mut self.core);
        self.finish_step(flow);
    }

    pub fn handle(&mut self, command: Command) {
        if self.core.disposed {
            if command == Command::Report {
                self.report();
            } else {
                log::debug!(
                    "transaction {}: disposed, ignoring {:?}",
                    self.core.id,
                    command
                );
            }
            return;
        }
        let flow = match command {
            Command::Activate => self.role.hooks().activate(&mut self.core),
            Command::Indication(pdu) => {
                log::debug!("transaction {}: received {}", self.core.id, pdu);
                self.core.reset_inactivity_timer();
                self.role.hooks().indication(&mut self.core, pdu)
            }
            Command::Cancel(code) => self.cancel(code),
            Command::Suspend => {
                self.suspend(ConditionCode::SuspendRequestReceived);
                ControlFlow::Continue(())
            }
            Command::Resume => self.resume(),
            Command::TxOpportunity(open) => self.update_opportunity(Some(open), None),
            Command::RxOpportunity(open) => self.update_opportunity(None, Some(open)),
            Command::Report => {
                self.report();
                ControlFlow::Continue(())
            }
            Command::KeepAlive => self.role.hooks().keep_alive_request(&mut self.core),
            Command::PromptNak => self.role.hooks().prompt_nak_request(&mut self.core),
            Command::TimerFired(token) => self.timer_fired(token),
            Command::Dispose => {
                if !self.core.state.is_terminal() {
                    self.abandon(ConditionCode::CancelRequestReceived);
                }
                self.dispose();
                ControlFlow::Continue(())
            }
        };
        self.finish_step(flow);
    }

    fn finish_step(&mut self, flow: Flow) {
        self.execute(flow);
        if self.core.dispose_requested {
            self.dispose();
        }
    }

    fn execute(&mut self, mut flow: Flow) {
        while let ControlFlow::Break(outcome) = flow {
            flow = match outcome {
                FaultOutcome::Suspension(code) => {
                    self.suspend(code);
                    ControlFlow::Continue(())
                }
                FaultOutcome::Cancellation(code) => self.cancel(code),
                FaultOutcome::Abandonment(code) => {
                    self.abandon(code);
                    ControlFlow::Continue(())
                }
            };
        }
    }

    fn timer_fired(&mut self, token: TimerToken) -> Flow {
        if !self.core.timers.accept(token) {
            return ControlFlow::Continue(());
        }
        log::debug!("transaction {}: {:?} timer expired", self.core.id, token.role);
        match token.role {
            TimerRole::Inactivity => {
                // Supervision goes on unless the fault ends the transaction.
                self.core.reset_inactivity_timer();
                self.core.declare_fault(ConditionCode::InactivityDetected)
            }
            TimerRole::PositiveAck => self.core.positive_ack_expired(),
            role => self.role.hooks().timer_expired(&mut self.core, role),
        }
    }

    fn cancel(&mut self, code: ConditionCode) -> Flow {
        if self.core.state.is_terminal() {
            log::debug!(
                "transaction {}: already {:?}, ignoring cancellation",
                self.core.id,
                self.core.state
            );
            return ControlFlow::Continue(());
        }
        log::info!("transaction {}: cancelled with {:?}", self.core.id, code);
        self.core.cancel_all_timers();
        if !self.core.is_frozen() {
            if let Some(paused) = self.core.paused.take() {
                self.core.timers.resume(paused);
            }
        }
        self.core.set_condition_code(code);
        self.core.set_state(TransactionState::Cancelled);
        self.role.hooks().cancel(&mut self.core, code)
    }

    fn suspend(&mut self, code: ConditionCode) {
        if self.core.state != TransactionState::Running {
            log::debug!(
                "transaction {}: not running, ignoring suspension",
                self.core.id
            );
            return;
        }
        self.core.set_state(TransactionState::Suspended);
        self.core.emit(Indication::Suspended {
            id: self.core.id,
            condition_code: code,
        });
        // Pausing never runs role procedures.
        let _ = self.update_pause();
    }

    fn resume(&mut self) -> Flow {
        if self.core.state != TransactionState::Suspended {
            log::debug!(
                "transaction {}: not suspended, ignoring resumption",
                self.core.id
            );
            return ControlFlow::Continue(());
        }
        self.core.set_state(TransactionState::Running);
        self.core.emit(Indication::Resumed {
            id: self.core.id,
            progress: self.core.progress,
        });
        self.update_pause()
    }

    fn update_opportunity(&mut self, tx: Option<bool>, rx: Option<bool>) -> Flow {
        let was_frozen = self.core.is_frozen();
        if let Some(tx) = tx {
            self.core.tx_allowed = tx;
        }
        if let Some(rx) = rx {
            self.core.rx_allowed = rx;
        }
        let frozen = self.core.is_frozen();
        if was_frozen != frozen {
            log::info!(
                "transaction {}: {}",
                self.core.id,
                if frozen { "frozen" } else { "thawed" }
            );
        }
        if was_frozen
            && !frozen
            && self.core.state == TransactionState::Running
            && self.core.env.local_cfg.indication_cfg.resumed_on_unfreeze
        {
            self.core.emit(Indication::Resumed {
                id: self.core.id,
                progress: self.core.progress,
            });
        }
        self.update_pause()
    }

    fn update_pause(&mut self) -> Flow {
        let should_pause =
            self.core.state == TransactionState::Suspended || self.core.is_frozen();
        match (should_pause, self.core.paused.is_some()) {
            (true, false) => {
                self.core.paused = Some(self.core.timers.pause_all());
                ControlFlow::Continue(())
            }
            (false, true) => {
                if let Some(paused) = self.core.paused.take() {
                    self.core.timers.resume(paused);
                }
                self.role.hooks().unpaused(&mut self.core)
            }
            _ => ControlFlow::Continue(()),
        }
    }

    fn abandon(&mut self, code: ConditionCode) {
        if self.core.state == TransactionState::Abandoned {
            return;
        }
        log::error!("transaction {}: abandoned with {:?}", self.core.id, code);
        self.core.set_condition_code(code);
        self.core.set_state(TransactionState::Abandoned);
        self.core.emit(Indication::Abandoned {
            id: self.core.id,
            condition_code: code,
            progress: self.core.progress,
        });
        self.core.request_dispose();
    }

    fn dispose(&mut self) {
        if self.core.disposed {
            return;
        }
        self.role.hooks().pre_dispose(&mut self.core);
        self.core.timers.cancel_all();
        self.core.paused = None;
        self.core.pending_ack = None;
        self.core.disposed = true;
        log::info!(
            "transaction {}: disposed in state {:?}",
            self.core.id,
            self.core.state
        );
        self.core.emit(Indication::TransactionDisposed {
            id: self.core.id,
            state: self.core.state,
        });
        self.core.env.events.disposed(self.core.id);
    }

    fn report(&self) {
        let (source_id, dest_id) = match self.core.entity_type {
            EntityType::Sending => (self.core.local_id, self.core.remote_cfg.entity_id),
            EntityType::Receiving => (self.core.remote_cfg.entity_id, self.core.local_id),
        };
        self.core.emit(Indication::Report(TransactionReport {
            timestamp: SystemTime::now(),
            id: self.core.id,
            source_id,
            dest_id,
            entity_type: self.core.entity_type,
            condition_code: self.core.condition_code,
            state: self.core.state,
            progress: self.core.progress,
            file_size: self.role.hooks_ref().file_size(),
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{mpsc, Mutex};

    use spacepackets::{
        cfdp::{pdu::FileDirectiveType, ChecksumType, Direction, TransactionStatus},
        util::UnsignedByteFieldU16,
    };
    use tempfile::TempDir;

    use super::*;
    use crate::{
        filestore::NativeFilestore,
        pdu::{EofPdu, PduHeader},
        tests::{basic_remote_cfg, LOCAL_ID, REMOTE_ID},
        timer::{ManualScheduler, TimerSink},
        transport::tests::RecordingTransport,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Indication(Indication),
        Terminated(TransactionId, TransactionState),
        Disposed(TransactionId),
    }

    #[derive(Default)]
    pub struct RecordingEvents {
        pub events: Mutex<Vec<Event>>,
    }

    impl RecordingEvents {
        pub fn take(&self) -> Vec<Event> {
            self.events.lock().unwrap().drain(..).collect()
        }

        pub fn take_indications(&self) -> Vec<Indication> {
            self.take()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Indication(indication) => Some(indication),
                    _ => None,
                })
                .collect()
        }
    }

    impl TransactionEvents for RecordingEvents {
        fn indication(&self, indication: Indication) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Indication(indication));
        }
        fn terminated(&self, id: TransactionId, state: TransactionState) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Terminated(id, state));
        }
        fn disposed(&self, id: TransactionId) {
            self.events.lock().unwrap().push(Event::Disposed(id));
        }
    }

    /// Drives a single transaction without worker threads. Expired timers are collected and fed
    /// back by [Testbench::advance].
    pub struct Testbench {
        pub transaction: Transaction,
        pub transport: Arc<RecordingTransport>,
        pub events: Arc<RecordingEvents>,
        pub scheduler: Arc<ManualScheduler>,
        pub status: Arc<SharedStatus>,
        pub remote_cfg: RemoteEntityConfig,
        pub tmpdir: TempDir,
        expired: mpsc::Receiver<TimerToken>,
    }

    pub struct TestbenchCfg {
        pub entity_type: EntityType,
        pub trans_mode: TransmissionMode,
        pub local_cfg: LocalEntityConfig,
        pub remote_cfg: RemoteEntityConfig,
        pub put: Option<PutRequest>,
        pub frozen: bool,
    }

    impl TestbenchCfg {
        pub fn new(entity_type: EntityType, trans_mode: TransmissionMode) -> Self {
            let mut remote_cfg = basic_remote_cfg(REMOTE_ID, trans_mode);
            remote_cfg.default_crc_type = ChecksumType::Crc32;
            Self {
                entity_type,
                trans_mode,
                local_cfg: LocalEntityConfig::new(
                    LOCAL_ID.into(),
                    IndicationConfig::default(),
                    FaultHandlerMap::default(),
                ),
                remote_cfg,
                put: None,
                frozen: false,
            }
        }
    }

    pub fn seq_num() -> UnsignedByteField {
        UnsignedByteFieldU16::new(3).into()
    }

    impl Testbench {
        pub fn new(cfg: TestbenchCfg) -> Self {
            let tmpdir = tempfile::tempdir().unwrap();
            let local_cfg = cfg
                .local_cfg
                .with_staging_dir(tmpdir.path().join("staging"));
            std::fs::create_dir_all(&local_cfg.staging_dir).unwrap();
            let transport = Arc::new(RecordingTransport::default());
            let events = Arc::new(RecordingEvents::default());
            let scheduler = Arc::new(ManualScheduler::default());
            let env = TransactionEnv::new(
                Arc::new(local_cfg),
                transport.clone(),
                Arc::new(NativeFilestore::default()),
                Arc::new(SegmentationChain::default()),
                scheduler.clone(),
                events.clone(),
            );
            let (expired_tx, expired) = mpsc::channel();
            let expired_tx = Mutex::new(expired_tx);
            let sink: TimerSink = Arc::new(move |token| {
                let _ = expired_tx.lock().unwrap().send(token);
            });
            let timers = TimerSet::new(scheduler.clone(), sink);
            let status = Arc::new(SharedStatus::default());
            let id = match cfg.entity_type {
                EntityType::Sending => TransactionId::new(LOCAL_ID.into(), seq_num()),
                EntityType::Receiving => TransactionId::new(REMOTE_ID.into(), seq_num()),
            };
            let params = TransactionParams::new(
                id,
                cfg.remote_cfg,
                cfg.trans_mode,
                env,
                timers,
                status.clone(),
                !cfg.frozen,
                true,
            );
            let transaction = match cfg.entity_type {
                EntityType::Sending => Transaction::new_outgoing(
                    params,
                    cfg.put.expect("outgoing testbench requires a put request"),
                ),
                EntityType::Receiving => Transaction::new_incoming(params),
            };
            Self {
                transaction,
                transport,
                events,
                scheduler,
                status,
                remote_cfg: cfg.remote_cfg,
                tmpdir,
                expired,
            }
        }

        pub fn id(&self) -> TransactionId {
            self.transaction.id()
        }

        /// Runs the transaction until it has no more pending work.
        pub fn run(&mut self) {
            while self.transaction.has_pending_work() {
                self.transaction.pump();
            }
        }

        pub fn handle(&mut self, command: Command) {
            self.transaction.handle(command);
            self.run();
        }

        /// Advances the virtual time and delivers all expired timer tokens. Returns the number of
        /// delivered tokens.
        pub fn advance(&mut self, by: Duration) -> usize {
            self.scheduler.advance(by);
            let mut delivered = 0;
            while let Ok(token) = self.expired.try_recv() {
                self.handle(Command::TimerFired(token));
                delivered += 1;
            }
            delivered
        }

        pub fn sent(&self) -> Vec<Pdu> {
            self.transport.take()
        }

        pub fn peer_header(&self, trans_mode: TransmissionMode, direction: Direction) -> PduHeader {
            let (source_id, dest_id) = match self.transaction.core.entity_type {
                EntityType::Sending => (LOCAL_ID.into(), REMOTE_ID.into()),
                EntityType::Receiving => (REMOTE_ID.into(), LOCAL_ID.into()),
            };
            PduHeader {
                source_id,
                dest_id,
                seq_num: seq_num(),
                trans_mode,
                direction,
                crc_flag: false,
                large_file: false,
            }
        }

        pub fn deliver(&mut self, payload: PduPayload) {
            let header = self.peer_header(self.transaction.core.trans_mode, payload.direction());
            self.handle(Command::Indication(Pdu::new(header, payload)));
        }

        pub fn path(&self, name: &str) -> String {
            self.tmpdir.path().join(name).to_str().unwrap().to_string()
        }
    }

    pub fn eof_payload(code: ConditionCode, checksum: u32, file_size: u64) -> PduPayload {
        PduPayload::Eof(EofPdu {
            condition_code: code,
            checksum,
            file_size,
            fault_location: None,
        })
    }

    pub fn ack_payload(directive: FileDirectiveType, code: ConditionCode) -> PduPayload {
        PduPayload::Ack(AckPdu {
            directive,
            condition_code: code,
            transaction_status: TransactionStatus::Active,
        })
    }

    fn metadata_only_sender(trans_mode: TransmissionMode) -> Testbench {
        let mut cfg = TestbenchCfg::new(EntityType::Sending, trans_mode);
        cfg.put = Some(PutRequest::new(REMOTE_ID.into(), None, None, None, Some(false)).unwrap());
        Testbench::new(cfg)
    }

    #[test]
    fn test_shared_status_snapshot() {
        let status = SharedStatus::default();
        let snapshot = status.load();
        assert_eq!(snapshot.state, TransactionState::Running);
        assert_eq!(snapshot.progress, 0);
        assert_eq!(snapshot.file_size, None);
        status.file_size.store(12, Ordering::Release);
        status
            .state
            .store(TransactionState::Completed as u8, Ordering::Release);
        let snapshot = status.load();
        assert_eq!(snapshot.file_size, Some(12));
        assert_eq!(snapshot.state, TransactionState::Completed);
    }

    #[test]
    fn test_positive_ack_limit_exact_resends() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        let sent = tb.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].directive_type(), Some(FileDirectiveType::EofPdu));
        let interval = tb.remote_cfg.positive_ack_timer_interval;
        let limit = tb.remote_cfg.positive_ack_timer_expiration_limit;
        for _ in 0..limit {
            tb.advance(interval);
            let resent = tb.sent();
            assert_eq!(resent.len(), 1);
            assert_eq!(resent[0], sent[1]);
        }
        tb.events.take();
        tb.advance(interval);
        assert!(tb.sent().iter().all(|pdu| pdu.condition_code()
            != Some(ConditionCode::NoError)
            || pdu.directive_type() != Some(FileDirectiveType::EofPdu)));
        let indications = tb.events.take_indications();
        assert!(indications.contains(&Indication::TransactionFinished(
            crate::user::TransactionFinishedParams {
                id: tb.id(),
                condition_code: ConditionCode::PositiveAckLimitReached,
                delivery_code: spacepackets::cfdp::pdu::finished::DeliveryCode::Incomplete,
                file_status: spacepackets::cfdp::pdu::finished::FileStatus::Unreported,
                fs_responses: Vec::new(),
            }
        )));
        assert_eq!(tb.transaction.state(), TransactionState::Cancelled);
    }

    #[test]
    fn test_ignored_fault_emits_fault_indication() {
        let mut cfg = TestbenchCfg::new(EntityType::Sending, TransmissionMode::Acknowledged);
        cfg.local_cfg.fault_handlers = FaultHandlerMap::default().with_handler(
            ConditionCode::InactivityDetected,
            FaultHandlerCode::IgnoreError,
        );
        cfg.put = Some(PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap());
        let mut tb = Testbench::new(cfg);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.advance(tb.remote_cfg.inactivity_timeout);
        let indications = tb.events.take_indications();
        assert!(indications.contains(&Indication::Fault {
            id: tb.id(),
            condition_code: ConditionCode::InactivityDetected,
            progress: 0
        }));
        assert_eq!(tb.transaction.state(), TransactionState::Running);
        assert!(tb.transaction.core.timers.is_armed(TimerRole::Inactivity));
    }

    #[test]
    fn test_suspend_resume_indications_once() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.handle(Command::Suspend);
        tb.handle(Command::Suspend);
        assert_eq!(tb.status.load().state, TransactionState::Suspended);
        assert!(!tb.transaction.core.timer_active(TimerRole::Check));
        assert!(!tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        assert!(tb.transaction.core.timer_active(TimerRole::PositiveAck));
        // Nothing is resent while suspended.
        tb.advance(tb.remote_cfg.inactivity_timeout * 2);
        assert!(tb.sent().is_empty());
        tb.handle(Command::Resume);
        tb.handle(Command::Resume);
        assert!(tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        assert!(tb.transaction.core.timers.is_armed(TimerRole::Inactivity));
        let indications = tb.events.take_indications();
        assert_eq!(
            indications,
            vec![
                Indication::Suspended {
                    id: tb.id(),
                    condition_code: ConditionCode::SuspendRequestReceived
                },
                Indication::Resumed {
                    id: tb.id(),
                    progress: 0
                }
            ]
        );
    }

    #[test]
    fn test_freeze_without_indications() {
        let mut cfg = TestbenchCfg::new(EntityType::Sending, TransmissionMode::Acknowledged);
        cfg.local_cfg.indication_cfg.resumed_on_unfreeze = false;
        cfg.put = Some(PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap());
        let mut tb = Testbench::new(cfg);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.handle(Command::TxOpportunity(false));
        assert!(!tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        assert_eq!(tb.status.load().state, TransactionState::Running);
        tb.handle(Command::TxOpportunity(true));
        assert!(tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        assert!(tb.events.take_indications().is_empty());
    }

    #[test]
    fn test_unfreeze_resumed_indication_switch() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.handle(Command::RxOpportunity(false));
        tb.handle(Command::RxOpportunity(true));
        assert_eq!(
            tb.events.take_indications(),
            vec![Indication::Resumed {
                id: tb.id(),
                progress: 0
            }]
        );
        // A suspended transaction stays suspended when thawed and does not publish a resumption.
        tb.handle(Command::Suspend);
        tb.handle(Command::TxOpportunity(false));
        tb.handle(Command::TxOpportunity(true));
        assert_eq!(tb.status.load().state, TransactionState::Suspended);
        assert!(!tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        assert_eq!(tb.events.take_indications().len(), 1);
    }

    #[test]
    fn test_suspension_while_frozen_keeps_timers_paused() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        tb.handle(Command::TxOpportunity(false));
        tb.handle(Command::Suspend);
        tb.handle(Command::Resume);
        assert!(!tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
        tb.handle(Command::TxOpportunity(true));
        assert!(tb.transaction.core.timers.is_armed(TimerRole::PositiveAck));
    }

    #[test]
    fn test_abandon_fault() {
        let mut cfg = TestbenchCfg::new(EntityType::Sending, TransmissionMode::Acknowledged);
        cfg.local_cfg.fault_handlers = FaultHandlerMap::default().with_handler(
            ConditionCode::InactivityDetected,
            FaultHandlerCode::AbandonTransaction,
        );
        cfg.put = Some(PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap());
        let mut tb = Testbench::new(cfg);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.sent();
        tb.advance(tb.remote_cfg.inactivity_timeout);
        let id = tb.id();
        let events = tb.events.take();
        let abandoned_idx = events
            .iter()
            .position(|e| {
                *e == Event::Indication(Indication::Abandoned {
                    id,
                    condition_code: ConditionCode::InactivityDetected,
                    progress: 0,
                })
            })
            .unwrap();
        assert!(events[abandoned_idx..].contains(&Event::Disposed(id)));
        assert!(events.contains(&Event::Terminated(id, TransactionState::Abandoned)));
        assert!(tb.transaction.is_disposed());
        // Abandonment skips the orderly closure.
        assert!(tb.sent().is_empty());
    }

    #[test]
    fn test_suspension_fault() {
        let mut cfg = TestbenchCfg::new(EntityType::Sending, TransmissionMode::Acknowledged);
        cfg.local_cfg.fault_handlers = FaultHandlerMap::default().with_handler(
            ConditionCode::InactivityDetected,
            FaultHandlerCode::NoticeOfSuspension,
        );
        cfg.put = Some(PutRequest::new(REMOTE_ID.into(), None, None, None, None).unwrap());
        let mut tb = Testbench::new(cfg);
        tb.handle(Command::Activate);
        tb.events.take();
        tb.advance(tb.remote_cfg.inactivity_timeout);
        assert_eq!(tb.transaction.state(), TransactionState::Suspended);
        assert_eq!(
            tb.events.take_indications(),
            vec![Indication::Suspended {
                id: tb.id(),
                condition_code: ConditionCode::InactivityDetected
            }]
        );
    }

    #[test]
    fn test_disposed_transaction_still_reports() {
        let mut tb = metadata_only_sender(TransmissionMode::Unacknowledged);
        tb.handle(Command::Activate);
        assert!(tb.transaction.is_disposed());
        tb.events.take();
        tb.handle(Command::Cancel(ConditionCode::CancelRequestReceived));
        tb.handle(Command::Dispose);
        assert!(tb.events.take().is_empty());
        tb.handle(Command::Report);
        let indications = tb.events.take_indications();
        assert_eq!(indications.len(), 1);
        match &indications[0] {
            Indication::Report(report) => {
                assert_eq!(report.state, TransactionState::Completed);
                assert_eq!(report.entity_type, EntityType::Sending);
                assert_eq!(report.dest_id.value(), REMOTE_ID.value());
            }
            other => panic!("unexpected indication {:?}", other),
        }
    }

    #[test]
    fn test_forced_dispose_abandons() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        tb.sent();
        tb.handle(Command::Dispose);
        assert!(tb.transaction.is_disposed());
        assert_eq!(tb.status.load().state, TransactionState::Abandoned);
        // Inactivity and positive ACK timer tasks are still queued but rejected on expiry.
        assert_eq!(tb.scheduler.pending(), 2);
        assert_eq!(tb.advance(tb.remote_cfg.inactivity_timeout), 2);
        assert!(tb.sent().is_empty());
    }

    #[test]
    fn test_stale_timer_after_ack() {
        let mut tb = metadata_only_sender(TransmissionMode::Acknowledged);
        tb.handle(Command::Activate);
        tb.sent();
        tb.deliver(ack_payload(FileDirectiveType::EofPdu, ConditionCode::NoError));
        assert!(!tb.transaction.core.awaiting_ack());
        tb.advance(tb.remote_cfg.positive_ack_timer_interval);
        assert!(tb.sent().is_empty());
    }

    #[test]
    fn test_indication_filter() {
        let cfg = IndicationConfig {
            eof_sent: false,
            ..Default::default()
        };
        let id = TransactionId::new(LOCAL_ID.into(), seq_num());
        assert!(!indication_enabled(&cfg, &Indication::EofSent(id)));
        assert!(indication_enabled(&cfg, &Indication::EofReceived(id)));
        assert!(indication_enabled(&cfg, &Indication::TransactionStarted(id)));
    }
}
