//! Typed CFDP protocol data units.
//!
//! Transport bindings exchange these structures directly. The binary layout of the PDUs is the
//! business of the binding, the engine only needs the field values.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use spacepackets::{
    cfdp::{
        pdu::{
            finished::{DeliveryCode, FileStatus},
            FileDirectiveType,
        },
        Direction, FaultHandlerCode, SegmentationControl, TransactionStatus, TransmissionMode,
    },
    util::{UnsignedByteField, UnsignedEnum},
};

use crate::{
    filestore::{FilestoreRequest, FilestoreResponse},
    ConditionCode, TransactionId,
};

/// Maximum number of segment requests carried by a single NAK PDU.
pub const NAK_SEGMENT_REQUESTS_PER_PDU: usize = 32;

/// Segment requests of one NAK PDU.
pub type SegmentRequests = SmallVec<[(u64, u64); 8]>;

/// Fault handler overrides which travel inside a put request or a Metadata PDU.
pub type FaultHandlerOverrides = SmallVec<[(ConditionCode, FaultHandlerCode); 4]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PduHeader {
    pub source_id: UnsignedByteField,
    pub dest_id: UnsignedByteField,
    pub seq_num: UnsignedByteField,
    pub trans_mode: TransmissionMode,
    pub direction: Direction,
    pub crc_flag: bool,
    pub large_file: bool,
}

impl PduHeader {
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.seq_num)
    }

    /// The entity this PDU is addressed to: the destination entity for PDUs flowing towards the
    /// receiver, the source entity otherwise.
    pub fn addressed_entity(&self) -> UnsignedByteField {
        match self.direction {
            Direction::TowardsReceiver => self.dest_id,
            Direction::TowardsSender => self.source_id,
        }
    }

    /// The entity which sent this PDU.
    pub fn sending_entity(&self) -> UnsignedByteField {
        match self.direction {
            Direction::TowardsReceiver => self.source_id,
            Direction::TowardsSender => self.dest_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataOptions {
    pub fault_handler_overrides: FaultHandlerOverrides,
    pub msgs_to_user: Vec<Vec<u8>>,
    pub fs_requests: Vec<FilestoreRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataPdu {
    pub closure_requested: bool,
    /// Raw checksum type field. The receiver resolves it and declares a fault for unsupported
    /// values.
    pub checksum_type: u8,
    pub file_size: u64,
    pub seg_ctrl: SegmentationControl,
    pub source_file: Option<String>,
    pub dest_file: Option<String>,
    pub options: MetadataOptions,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RecordContinuationState {
    NoStartNoEnd = 0b00,
    StartWithoutEnd = 0b01,
    EndWithoutStart = 0b10,
    StartAndEnd = 0b11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmentMetadata {
    pub record_continuation_state: RecordContinuationState,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FileDataPdu {
    pub offset: u64,
    pub data: Vec<u8>,
    pub segment_metadata: Option<SegmentMetadata>,
}

impl FileDataPdu {
    /// End offset of the carried data. [None] if it lies beyond the largest possible file.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.data.len() as u64)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.offset < end && self.end().map_or(true, |data_end| start < data_end)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub checksum: u32,
    pub file_size: u64,
    pub fault_location: Option<UnsignedByteField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinishedPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub fs_responses: Vec<FilestoreResponse>,
    pub fault_location: Option<UnsignedByteField>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AckPdu {
    /// Either [FileDirectiveType::EofPdu] or [FileDirectiveType::FinishedPdu].
    pub directive: FileDirectiveType,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NakPdu {
    pub start_of_scope: u64,
    pub end_of_scope: u64,
    /// A `(0, 0)` request asks for the Metadata PDU.
    pub segment_requests: SegmentRequests,
}

impl NakPdu {
    /// Groups the segment requests into NAK PDUs carrying at most
    /// [NAK_SEGMENT_REQUESTS_PER_PDU] requests each. The first PDU starts at `start_of_scope`,
    /// the last PDU ends at `end_of_scope`.
    pub fn batches(start_of_scope: u64, end_of_scope: u64, requests: &[(u64, u64)]) -> Vec<NakPdu> {
        if requests.is_empty() {
            return vec![NakPdu {
                start_of_scope,
                end_of_scope,
                segment_requests: SegmentRequests::new(),
            }];
        }
        let chunk_count = requests.chunks(NAK_SEGMENT_REQUESTS_PER_PDU).count();
        requests
            .chunks(NAK_SEGMENT_REQUESTS_PER_PDU)
            .enumerate()
            .map(|(idx, chunk)| {
                let start = if idx == 0 {
                    start_of_scope
                } else {
                    chunk[0].0
                };
                let end = if idx + 1 == chunk_count {
                    end_of_scope
                } else {
                    chunk[chunk.len() - 1].1
                };
                NakPdu {
                    start_of_scope: start,
                    end_of_scope: end,
                    segment_requests: chunk.iter().copied().collect(),
                }
            })
            .collect()
    }

    pub fn requests_metadata(&self) -> bool {
        self.segment_requests.iter().any(|req| *req == (0, 0))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PromptResponse {
    Nak,
    KeepAlive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PromptPdu {
    pub response: PromptResponse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeepAlivePdu {
    pub progress: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PduPayload {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Prompt(PromptPdu),
    KeepAlive(KeepAlivePdu),
}

impl PduPayload {
    /// Returns [None] for file data PDUs.
    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        Some(match self {
            PduPayload::Metadata(_) => FileDirectiveType::MetadataPdu,
            PduPayload::FileData(_) => return None,
            PduPayload::Eof(_) => FileDirectiveType::EofPdu,
            PduPayload::Finished(_) => FileDirectiveType::FinishedPdu,
            PduPayload::Ack(_) => FileDirectiveType::AckPdu,
            PduPayload::Nak(_) => FileDirectiveType::NakPdu,
            PduPayload::Prompt(_) => FileDirectiveType::PromptPdu,
            PduPayload::KeepAlive(_) => FileDirectiveType::KeepAlivePdu,
        })
    }

    /// Flow direction of the PDU relative to the file transfer.
    pub fn direction(&self) -> Direction {
        match self {
            PduPayload::Metadata(_)
            | PduPayload::FileData(_)
            | PduPayload::Eof(_)
            | PduPayload::Prompt(_) => Direction::TowardsReceiver,
            PduPayload::Finished(_) | PduPayload::Nak(_) | PduPayload::KeepAlive(_) => {
                Direction::TowardsSender
            }
            PduPayload::Ack(ack) => {
                if ack.directive == FileDirectiveType::EofPdu {
                    Direction::TowardsSender
                } else {
                    Direction::TowardsReceiver
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pdu {
    pub header: PduHeader,
    pub payload: PduPayload,
}

impl Pdu {
    pub fn new(header: PduHeader, payload: PduPayload) -> Self {
        Self { header, payload }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id()
    }

    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        self.payload.directive_type()
    }

    /// EOF and Finished PDUs of acknowledged transactions must be acknowledged.
    pub fn requires_ack(&self) -> bool {
        self.header.trans_mode == TransmissionMode::Acknowledged
            && matches!(self.payload, PduPayload::Eof(_) | PduPayload::Finished(_))
    }

    /// Condition code carried by EOF and Finished PDUs.
    pub fn condition_code(&self) -> Option<ConditionCode> {
        match &self.payload {
            PduPayload::Eof(eof) => Some(eof.condition_code),
            PduPayload::Finished(finished) => Some(finished.condition_code),
            PduPayload::Ack(ack) => Some(ack.condition_code),
            _ => None,
        }
    }

    /// Builds the ACK answering this PDU, with the header addressed back to the sender.
    pub fn ack_reply(&self, transaction_status: TransactionStatus) -> Option<Pdu> {
        let directive = self.directive_type()?;
        if !matches!(
            directive,
            FileDirectiveType::EofPdu | FileDirectiveType::FinishedPdu
        ) {
            return None;
        }
        let payload = PduPayload::Ack(AckPdu {
            directive,
            condition_code: self.condition_code()?,
            transaction_status,
        });
        let mut header = self.header;
        header.direction = payload.direction();
        Some(Pdu::new(header, payload))
    }
}

impl core::fmt::Display for Pdu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.directive_type() {
            Some(directive) => write!(f, "{:?}", directive)?,
            None => write!(f, "FileData")?,
        }
        write!(
            f,
            " [{} -> {}, {}]",
            self.header.source_id.value(),
            self.header.dest_id.value(),
            self.transaction_id()
        )
    }
}
