//! This crate implements the transaction layer of the CCSDS File Delivery Protocol (CFDP) as
//! specified in CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). CFDP has an unacknowledged and acknowledged mode, with the option to request
//! a transaction closure for the unacknowledged mode. The acknowledged mode includes multiple
//! mechanisms to ensure successful file transfers over unreliable links, including lost segment
//! detection, positive acknowledgement procedures and keep-alive monitoring.
//!
//! The core of this library is the [entity::Entity]. An entity owns all live transactions of a
//! local CFDP entity. Every transaction runs on its own worker thread and is fed through a bounded
//! command queue, so all protocol state of a transaction is confined to that worker. Timers run on
//! a shared [timer::SchedulingClock] and post their expiry back into the owning transaction queue.
//! Application-visible events are published as [user::Indication]s on a dedicated notifier thread.
//!
//! The entity is decoupled from its environment by a few traits:
//!
//! - [transport::TransportBinding]: sends typed [pdu::Pdu]s to a remote entity and delivers
//!   received PDUs and reachability windows back to the entity.
//! - [filestore::VirtualFilestore]: all file system access. [filestore::NativeFilestore] is
//!   provided for [std] systems.
//! - [segmenter::SegmentationStrategy]: cuts source files into file data segments.
//! - [RemoteEntityConfigProvider]: the per-remote-entity management information base.
//!
//! # Examples
//!
//! The end-to-end integration tests spawn two entities which are connected through a
//! [transport::LoopbackTransport] and perform file copy operations in both transmission modes.
//!
//! ```sh
//! cargo test --test end-to-end -- --nocapture
//! ```
//!
//! The `loopback` demo performs a single file copy operation with a configurable drop rate:
//!
//! ```sh
//! cargo run --example loopback -- --acknowledged --drop-every 7 <FILE>
//! ```
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
pub mod checksum;
pub mod entity;
pub mod fault;
pub mod filestore;
pub mod pdu;
pub mod request;
pub mod segmenter;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod user;

use core::{fmt::Debug, hash::Hash, time::Duration};
use std::path::PathBuf;

use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::util::{UnsignedByteField, UnsignedEnum};

pub use spacepackets::cfdp::{ChecksumType, FaultHandlerCode, TransmissionMode};

pub use crate::fault::FaultHandlerMap;

/// Condition codes as specified in chapter 5.2.2 of the CFDP standard.
///
/// Apart from [ConditionCode::NoError], [ConditionCode::SuspendRequestReceived] and
/// [ConditionCode::CancelRequestReceived], every condition code denotes a fault which is routed
/// through the [FaultHandlerMap].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

impl ConditionCode {
    /// All condition codes which can have a fault handler assigned.
    pub const FAULTS: [ConditionCode; 11] = [
        ConditionCode::PositiveAckLimitReached,
        ConditionCode::KeepAliveLimitReached,
        ConditionCode::InvalidTransmissionMode,
        ConditionCode::FilestoreRejection,
        ConditionCode::FileChecksumFailure,
        ConditionCode::FileSizeError,
        ConditionCode::NakLimitReached,
        ConditionCode::InactivityDetected,
        ConditionCode::InvalidFileStructure,
        ConditionCode::CheckLimitReached,
        ConditionCode::UnsupportedChecksumType,
    ];

    pub fn is_fault(&self) -> bool {
        !matches!(
            self,
            ConditionCode::NoError
                | ConditionCode::SuspendRequestReceived
                | ConditionCode::CancelRequestReceived
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid condition code {0}")]
pub struct InvalidConditionCode(pub u8);

impl TryFrom<u8> for ConditionCode {
    type Error = InvalidConditionCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0b0000 => ConditionCode::NoError,
            0b0001 => ConditionCode::PositiveAckLimitReached,
            0b0010 => ConditionCode::KeepAliveLimitReached,
            0b0011 => ConditionCode::InvalidTransmissionMode,
            0b0100 => ConditionCode::FilestoreRejection,
            0b0101 => ConditionCode::FileChecksumFailure,
            0b0110 => ConditionCode::FileSizeError,
            0b0111 => ConditionCode::NakLimitReached,
            0b1000 => ConditionCode::InactivityDetected,
            0b1001 => ConditionCode::InvalidFileStructure,
            0b1010 => ConditionCode::CheckLimitReached,
            0b1011 => ConditionCode::UnsupportedChecksumType,
            0b1110 => ConditionCode::SuspendRequestReceived,
            0b1111 => ConditionCode::CancelRequestReceived,
            _ => return Err(InvalidConditionCode(value)),
        })
    }
}

/// Role of the local entity inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityType {
    Sending,
    Receiving,
}

/// Lifecycle state of a transaction.
///
/// `Running` and `Suspended` are the only non-terminal states. A frozen transaction keeps its
/// state, see [transaction] for the distinction between freezing and suspension.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum TransactionState {
    Running = 0,
    Suspended = 1,
    Cancelled = 2,
    Completed = 3,
    Abandoned = 4,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Cancelled | TransactionState::Completed | TransactionState::Abandoned
        )
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => TransactionState::Running,
            1 => TransactionState::Suspended,
            2 => TransactionState::Cancelled,
            3 => TransactionState::Completed,
            _ => TransactionState::Abandoned,
        }
    }
}

/// This structure models the remote entity configuration information as specified in chapter 8.3
/// of the CFDP standard.
///
/// Some of the fields which were not considered necessary for the Rust implementation
/// were omitted. Some other fields which are not contained inside the standard but are considered
/// necessary for the Rust implementation are included.
///
/// ## Notes on Positive Acknowledgment Procedures
///
/// The `positive_ack_timer_interval` and `positive_ack_timer_expiration_limit` will
/// be used for positive acknowledgement procedures as specified in CFDP chapter 4.7. The sending
/// entity will start the timer for any PDUs where an acknowledgment is required (e.g. EOF PDU).
/// Each time the expected ACK response has not been received for that interval, the PDU is sent
/// again and a counter is incremented. Once the counter has reached the
/// `positive_ack_timer_expiration_limit`, the next expiry declares a Positive ACK Limit Reached
/// fault instead of another retransmission.
///
/// ## Notes on Deferred Lost Segment Procedures
///
/// This procedure will be active if an EOF (No Error) PDU is received in acknowledged mode. After
/// issuing the NAK sequence which has the whole file scope, a periodic timer will be started. The
/// timer will be deactivated if all missing data is received. Each expiry issues a new NAK
/// sequence and increments a counter, which can lead to a NAK Limit Reached fault being declared.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity.
/// * `max_file_segment_len` - The maximum file segment length which determines the maximum size
///   of file data PDUs.
/// * `closure_requested_by_default` - If the closure requested field is not supplied as part of
///   the Put Request, it will be determined from this field in the remote configuration.
/// * `crc_on_transmission_by_default` - Sets the CRC flag of all PDUs sent to this entity.
/// * `default_transmission_mode` - If the transmission mode is not supplied as part of the
///   Put Request, it will be determined from this field in the remote configuration.
/// * `default_crc_type` - Default checksum type used to calculate for all file transmissions to
///   this remote entity.
/// * `retain_incomplete_on_cancellation` - Determines whether an incomplete received file is
///   retained on transaction cancellation. Defaults to false.
/// * `check_timer_interval` and `check_limit` - For unacknowledged transfers, the check timer
///   bounds the wait for a Finished PDU on the sending side and the wait for missing file data
///   after EOF on the receiving side. Defaults to 2 expirations of 5 seconds each.
/// * `positive_ack_timer_interval` and `positive_ack_timer_expiration_limit` - See the notes on
///   the Positive Acknowledgment Procedures. Defaults to 2 retries every 10 seconds.
/// * `immediate_nak_mode` - Specifies whether a NAK sequence should be issued before EOF when a
///   file data gap or lost metadata is detected in the acknowledged mode. Defaults to true.
/// * `nak_timer_interval` and `nak_timer_expiration_limit` - See the notes on the Deferred Lost
///   Segment Procedure. Defaults to 2 expirations every 10 seconds.
/// * `nak_recomputation_interval` - Delay before an immediate mode NAK sequence is computed after a
///   gap was detected. Prompt (NAK) PDUs restart this timer.
/// * `keep_alive_interval` - Period of keep-alive PDUs sent by an acknowledged mode receiver.
/// * `keep_alive_discrepancy_limit` - Maximum allowed difference between the sender progress and
///   the progress reported by a keep-alive PDU.
/// * `inactivity_timeout` - Transaction inactivity limit for acknowledged mode senders and all
///   receivers.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub max_file_segment_len: usize,
    pub closure_requested_by_default: bool,
    pub crc_on_transmission_by_default: bool,
    pub default_transmission_mode: TransmissionMode,
    pub default_crc_type: ChecksumType,
    pub retain_incomplete_on_cancellation: bool,
    pub check_timer_interval: Duration,
    pub check_limit: u32,
    pub positive_ack_timer_interval: Duration,
    pub positive_ack_timer_expiration_limit: u32,
    pub immediate_nak_mode: bool,
    pub nak_timer_interval: Duration,
    pub nak_timer_expiration_limit: u32,
    pub nak_recomputation_interval: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_discrepancy_limit: u64,
    pub inactivity_timeout: Duration,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_file_segment_len: usize,
        closure_requested_by_default: bool,
        crc_on_transmission_by_default: bool,
        default_transmission_mode: TransmissionMode,
        default_crc_type: ChecksumType,
    ) -> Self {
        Self {
            entity_id,
            max_file_segment_len,
            closure_requested_by_default,
            crc_on_transmission_by_default,
            default_transmission_mode,
            default_crc_type,
            retain_incomplete_on_cancellation: false,
            check_timer_interval: Duration::from_secs(5),
            check_limit: 2,
            positive_ack_timer_interval: Duration::from_secs(10),
            positive_ack_timer_expiration_limit: 2,
            immediate_nak_mode: true,
            nak_timer_interval: Duration::from_secs(10),
            nak_timer_expiration_limit: 2,
            nak_recomputation_interval: Duration::from_secs(2),
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_discrepancy_limit: 1 << 20,
            inactivity_timeout: Duration::from_secs(60),
        }
    }

    /// Rescales every timer interval so that one second of the configured profile lasts `scale`.
    pub fn with_timer_scale(mut self, scale: Duration) -> Self {
        let scaled = |d: Duration| {
            Duration::from_nanos((d.as_nanos() * scale.as_nanos() / 1_000_000_000) as u64)
        };
        self.check_timer_interval = scaled(self.check_timer_interval);
        self.positive_ack_timer_interval = scaled(self.positive_ack_timer_interval);
        self.nak_timer_interval = scaled(self.nak_timer_interval);
        self.nak_recomputation_interval = scaled(self.nak_recomputation_interval);
        self.keep_alive_interval = scaled(self.keep_alive_interval);
        self.inactivity_timeout = scaled(self.inactivity_timeout);
        self
    }
}

pub trait RemoteEntityConfigProvider {
    /// Retrieve the remote entity configuration for the given remote ID.
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig>;
    /// Add a new remote configuration. Return [true] if the configuration was
    /// inserted successfully, and [false] if a configuration already exists.
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool;
    /// Remote a configuration. Returns [true] if the configuration was removed successfully,
    /// and [false] if no configuration exists for the given remote ID.
    fn remove_config(&mut self, remote_id: u64) -> bool;
}

/// This is a thin wrapper around a [HashMap] to store remote entity configurations.
/// It implements the full [RemoteEntityConfigProvider] trait.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StdRemoteEntityConfigProvider(pub HashMap<u64, RemoteEntityConfig>);

impl RemoteEntityConfigProvider for StdRemoteEntityConfigProvider {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0.get_mut(&remote_id)
    }
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        if self.0.contains_key(&cfg.entity_id.value()) {
            return false;
        }
        self.0.insert(cfg.entity_id.value(), *cfg);
        true
    }
    fn remove_config(&mut self, remote_id: u64) -> bool {
        self.0.remove(&remote_id).is_some()
    }
}

/// This is a thin wrapper around a [Vec] to store remote entity configurations.
/// It implements the full [RemoteEntityConfigProvider] trait.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VecRemoteEntityConfigProvider(pub Vec<RemoteEntityConfig>);

impl RemoteEntityConfigProvider for VecRemoteEntityConfigProvider {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0
            .iter()
            .find(|&cfg| cfg.entity_id.value() == remote_id)
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0
            .iter_mut()
            .find(|cfg| cfg.entity_id.value() == remote_id)
    }

    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        if self.get(cfg.entity_id.value()).is_some() {
            return false;
        }
        self.0.push(*cfg);
        true
    }

    fn remove_config(&mut self, remote_id: u64) -> bool {
        let len_before = self.0.len();
        self.0.retain(|cfg| cfg.entity_id.value() != remote_id);
        self.0.len() != len_before
    }
}

/// A remote entity configurations also implements the [RemoteEntityConfigProvider], but the
/// [RemoteEntityConfigProvider::add_config] and [RemoteEntityConfigProvider::remove_config]
/// are no-ops and always returns [false].
impl RemoteEntityConfigProvider for RemoteEntityConfig {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn add_config(&mut self, _cfg: &RemoteEntityConfig) -> bool {
        false
    }

    fn remove_config(&mut self, _remote_id: u64) -> bool {
        false
    }
}

/// Selects which of the optional indications are published to the subscribers.
///
/// `resumed_on_unfreeze` decides whether thawing a frozen transaction, which was not explicitly
/// suspended as well, publishes a [user::Indication::Resumed].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
    pub resumed_on_unfreeze: bool,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
            resumed_on_unfreeze: true,
        }
    }
}

/// Default bounded capacity of the command queue of each transaction.
pub const DEFAULT_TRANSACTION_QUEUE_CAPACITY: usize = 256;

/// Each CFDP entity has a [LocalEntityConfig]uration.
#[derive(Debug, Clone)]
pub struct LocalEntityConfig {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub fault_handlers: FaultHandlerMap,
    /// Directory for files which are still being received.
    pub staging_dir: PathBuf,
    pub transaction_queue_capacity: usize,
}

impl LocalEntityConfig {
    pub fn new(
        id: UnsignedByteField,
        indication_cfg: IndicationConfig,
        fault_handlers: FaultHandlerMap,
    ) -> Self {
        Self {
            id,
            indication_cfg,
            fault_handlers,
            staging_dir: std::env::temp_dir(),
            transaction_queue_capacity: DEFAULT_TRANSACTION_QUEUE_CAPACITY,
        }
    }

    pub fn with_staging_dir(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = staging_dir.into();
        self
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the sequence
/// number of that transfer which is also determined by the CFDP source entity.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source_id.value(), self.seq_num.value())
    }
}

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
