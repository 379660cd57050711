//! Application facing indications and the notifier thread which publishes them.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Mutex},
    thread::JoinHandle,
    time::SystemTime,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::{
    cfdp::pdu::finished::{DeliveryCode, FileStatus},
    util::UnsignedByteField,
};

use crate::{
    filestore::FilestoreResponse, pdu::RecordContinuationState, ConditionCode, EntityType,
    TransactionId, TransactionState,
};

/// Status snapshot of a transaction, published through [Indication::Report].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionReport {
    pub timestamp: SystemTime,
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub dest_id: UnsignedByteField,
    pub entity_type: EntityType,
    pub condition_code: ConditionCode,
    pub state: TransactionState,
    pub progress: u64,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataRecvParams {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub source_file: Option<String>,
    pub dest_file: Option<String>,
    pub msgs_to_user: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FileSegmentRecvParams {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub record_continuation_state: Option<RecordContinuationState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub fs_responses: Vec<FilestoreResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Indication {
    TransactionStarted(TransactionId),
    MetadataReceived(MetadataRecvParams),
    FileSegmentReceived(FileSegmentRecvParams),
    EofSent(TransactionId),
    EofReceived(TransactionId),
    Suspended {
        id: TransactionId,
        condition_code: ConditionCode,
    },
    Resumed {
        id: TransactionId,
        progress: u64,
    },
    Fault {
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    },
    Abandoned {
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    },
    TransactionFinished(TransactionFinishedParams),
    TransactionDisposed {
        id: TransactionId,
        state: TransactionState,
    },
    EntityDisposed,
    Report(TransactionReport),
}

impl Indication {
    /// Returns [None] only for [Indication::EntityDisposed].
    pub fn transaction_id(&self) -> Option<TransactionId> {
        Some(match self {
            Indication::TransactionStarted(id)
            | Indication::EofSent(id)
            | Indication::EofReceived(id) => *id,
            Indication::MetadataReceived(params) => params.id,
            Indication::FileSegmentReceived(params) => params.id,
            Indication::Suspended { id, .. }
            | Indication::Resumed { id, .. }
            | Indication::Fault { id, .. }
            | Indication::Abandoned { id, .. }
            | Indication::TransactionDisposed { id, .. } => *id,
            Indication::TransactionFinished(params) => params.id,
            Indication::Report(report) => report.id,
            Indication::EntityDisposed => return None,
        })
    }
}

/// Consumer of indications. Subscribers run on the notifier thread, a panicking subscriber is
/// logged and keeps its subscription.
pub trait IndicationSubscriber: Send {
    fn indication(&mut self, indication: &Indication);
}

impl<F: FnMut(&Indication) + Send> IndicationSubscriber for F {
    fn indication(&mut self, indication: &Indication) {
        self(indication)
    }
}

/// Forwards every indication into a channel.
pub fn channel_subscriber(sender: mpsc::Sender<Indication>) -> Box<dyn IndicationSubscriber> {
    Box::new(move |indication: &Indication| {
        let _ = sender.send(indication.clone());
    })
}

enum NotifierMsg {
    Subscribe(Box<dyn IndicationSubscriber>),
    Notify(Indication),
    Shutdown,
}

/// Publishes indications to all subscribers in order on a dedicated thread.
pub struct Notifier {
    sender: mpsc::Sender<NotifierMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(thread_name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || Self::run(receiver))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(receiver: mpsc::Receiver<NotifierMsg>) {
        let mut subscribers: Vec<Box<dyn IndicationSubscriber>> = Vec::new();
        while let Ok(msg) = receiver.recv() {
            match msg {
                NotifierMsg::Subscribe(subscriber) => subscribers.push(subscriber),
                NotifierMsg::Notify(indication) => {
                    log::trace!("publishing {:?}", indication);
                    for (idx, subscriber) in subscribers.iter_mut().enumerate() {
                        let result =
                            catch_unwind(AssertUnwindSafe(|| subscriber.indication(&indication)));
                        if result.is_err() {
                            log::error!("indication subscriber {} panicked", idx);
                        }
                    }
                }
                NotifierMsg::Shutdown => break,
            }
        }
    }

    pub fn subscribe(&self, subscriber: Box<dyn IndicationSubscriber>) {
        let _ = self.sender.send(NotifierMsg::Subscribe(subscriber));
    }

    pub fn notify(&self, indication: Indication) {
        if self.sender.send(NotifierMsg::Notify(indication)).is_err() {
            log::debug!("notifier stopped, dropping indication");
        }
    }

    /// Publishes all queued indications and stops the notifier thread.
    pub fn shutdown(&self) {
        let _ = self.sender.send(NotifierMsg::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("notifier thread panicked");
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
