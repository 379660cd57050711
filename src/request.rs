//! User requests accepted by an [crate::entity::Entity].
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::{
    cfdp::{FaultHandlerCode, SegmentationControl, TransmissionMode},
    util::UnsignedByteField,
};

use crate::{
    filestore::FilestoreRequest, pdu::FaultHandlerOverrides, ConditionCode, RemoteEntityConfig,
    TransactionId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[error("file path too large: {0} bytes")]
pub struct FilePathTooLarge(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PutRequestError {
    #[error(transparent)]
    FilePathTooLarge(#[from] FilePathTooLarge),
    #[error("a source file requires a destination file and vice versa")]
    IncompleteFilePair,
}

pub fn generic_path_checks(
    source_file: Option<&str>,
    dest_file: Option<&str>,
) -> Result<(), FilePathTooLarge> {
    for path in [source_file, dest_file].into_iter().flatten() {
        if path.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(path.len()));
        }
    }
    Ok(())
}

/// Put request for a file copy operation.
///
/// Fields which are [None] are resolved from the [RemoteEntityConfig] of the destination when
/// the transaction is created. A request without a file pair only transfers metadata, which is
/// useful to send messages to user or filestore requests.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PutRequest {
    pub destination_id: UnsignedByteField,
    source_file: Option<String>,
    dest_file: Option<String>,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
    pub seg_ctrl: Option<SegmentationControl>,
    pub fault_handler_overrides: FaultHandlerOverrides,
    pub msgs_to_user: Vec<Vec<u8>>,
    pub fs_requests: Vec<FilestoreRequest>,
}

impl PutRequest {
    pub fn new(
        destination_id: UnsignedByteField,
        source_file: Option<&str>,
        dest_file: Option<&str>,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, PutRequestError> {
        generic_path_checks(source_file, dest_file)?;
        if source_file.is_some() != dest_file.is_some() {
            return Err(PutRequestError::IncompleteFilePair);
        }
        Ok(Self {
            destination_id,
            source_file: source_file.map(String::from),
            dest_file: dest_file.map(String::from),
            trans_mode,
            closure_requested,
            seg_ctrl: None,
            fault_handler_overrides: FaultHandlerOverrides::new(),
            msgs_to_user: Vec::new(),
            fs_requests: Vec::new(),
        })
    }

    pub fn new_regular_request(
        dest_id: UnsignedByteField,
        source_file: &str,
        dest_file: &str,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, PutRequestError> {
        Self::new(
            dest_id,
            Some(source_file),
            Some(dest_file),
            trans_mode,
            closure_requested,
        )
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    pub fn dest_file(&self) -> Option<&str> {
        self.dest_file.as_deref()
    }

    pub fn with_fault_handler_override(
        mut self,
        code: ConditionCode,
        action: FaultHandlerCode,
    ) -> Self {
        self.fault_handler_overrides.push((code, action));
        self
    }

    pub fn with_msg_to_user(mut self, msg: impl Into<Vec<u8>>) -> Self {
        self.msgs_to_user.push(msg.into());
        self
    }

    pub fn with_fs_request(mut self, request: FilestoreRequest) -> Self {
        self.fs_requests.push(request);
        self
    }

    pub fn with_record_boundaries(mut self) -> Self {
        self.seg_ctrl = Some(SegmentationControl::WithRecordBoundaryPreservation);
        self
    }

    pub fn trans_mode_or_default(&self, remote_cfg: &RemoteEntityConfig) -> TransmissionMode {
        self.trans_mode
            .unwrap_or(remote_cfg.default_transmission_mode)
    }

    pub fn closure_requested_or_default(&self, remote_cfg: &RemoteEntityConfig) -> bool {
        self.closure_requested
            .unwrap_or(remote_cfg.closure_requested_by_default)
    }

    pub fn record_boundaries_requested(&self) -> bool {
        self.seg_ctrl == Some(SegmentationControl::WithRecordBoundaryPreservation)
    }
}

/// Every request a user can issue to an entity. Apart from [Request::Put], requests address an
/// existing transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Request {
    Put(PutRequest),
    Cancel(TransactionId),
    Suspend(TransactionId),
    Resume(TransactionId),
    Report(TransactionId),
    /// Asks the receiver for a keep-alive PDU, or sends one when issued at the receiver.
    KeepAlive(TransactionId),
    /// Asks the receiver for a NAK sequence, or sends one when issued at the receiver.
    PromptNak(TransactionId),
}

impl Request {
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Request::Put(_) => None,
            Request::Cancel(id)
            | Request::Suspend(id)
            | Request::Resume(id)
            | Request::Report(id)
            | Request::KeepAlive(id)
            | Request::PromptNak(id) => Some(*id),
        }
    }
}
