//! Sending side of a file copy operation.
use core::ops::ControlFlow;
use std::collections::BTreeSet;

use spacepackets::cfdp::{
    pdu::{
        finished::{DeliveryCode, FileStatus},
        FileDirectiveType,
    },
    SegmentationControl, TransactionStatus,
};

use super::{RoleHooks, TransactionCore};
use crate::{
    checksum::{checksum_type_supported, RunningChecksum},
    fault::{FaultOutcome, Flow},
    filestore::FilestoreResponse,
    pdu::{
        AckPdu, EofPdu, FileDataPdu, FinishedPdu, KeepAlivePdu, MetadataOptions, MetadataPdu,
        NakPdu, Pdu, PduPayload, PromptPdu, PromptResponse,
    },
    request::PutRequest,
    segmenter::Segmenter,
    timer::TimerRole,
    user::{Indication, TransactionFinishedParams},
    ChecksumType, ConditionCode,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    SendingFileData,
    /// Acknowledged mode: waiting for the Finished PDU.
    AwaitingFinished,
    /// Unacknowledged mode with closure: waiting for the Finished PDU under the check timer.
    AwaitingClosure,
    Done,
}

pub(crate) struct OutgoingTransaction {
    put: PutRequest,
    closure_requested: bool,
    checksum: RunningChecksum,
    file_size: Option<u64>,
    metadata: Option<MetadataPdu>,
    metadata_sent: bool,
    segmenter: Option<Box<dyn Segmenter>>,
    /// File data PDUs kept for retransmission, only filled in acknowledged mode.
    sent_file_data: Vec<FileDataPdu>,
    check_count: u32,
    phase: Phase,
}

impl OutgoingTransaction {
    pub fn new(core: &TransactionCore, put: PutRequest) -> Self {
        let checksum_type = core.remote_cfg.default_crc_type;
        let checksum = if checksum_type_supported(checksum_type) {
            RunningChecksum::new_or_null(checksum_type)
        } else {
            log::warn!(
                "transaction {}: checksum type {:?} not supported, using the null checksum",
                core.id,
                checksum_type
            );
            RunningChecksum::new_or_null(ChecksumType::NullChecksum)
        };
        Self {
            closure_requested: put.closure_requested_or_default(&core.remote_cfg),
            put,
            checksum,
            file_size: None,
            metadata: None,
            metadata_sent: false,
            segmenter: None,
            sent_file_data: Vec::new(),
            check_count: 0,
            phase: Phase::Idle,
        }
    }

    fn send_metadata(&mut self, core: &mut TransactionCore) {
        let metadata = MetadataPdu {
            closure_requested: self.closure_requested,
            checksum_type: self.checksum.checksum_type() as u8,
            file_size: self.file_size.unwrap_or(0),
            seg_ctrl: self
                .put
                .seg_ctrl
                .unwrap_or(SegmentationControl::NoRecordBoundaryPreservation),
            source_file: self.put.source_file().map(String::from),
            dest_file: self.put.dest_file().map(String::from),
            options: MetadataOptions {
                fault_handler_overrides: self.put.fault_handler_overrides.clone(),
                msgs_to_user: self.put.msgs_to_user.clone(),
                fs_requests: self.put.fs_requests.clone(),
            },
        };
        let _ = core.send(PduPayload::Metadata(metadata.clone()));
        self.metadata_sent = true;
        if core.is_acknowledged() {
            self.metadata = Some(metadata);
        }
    }

    /// Sends the metadata once the transaction may transmit. Transactions without file data send
    /// their EOF right away.
    fn start_transmission(&mut self, core: &mut TransactionCore) -> Flow {
        if self.metadata_sent || self.phase != Phase::SendingFileData || !core.may_transmit() {
            return ControlFlow::Continue(());
        }
        self.send_metadata(core);
        if self.segmenter.is_none() {
            return self.send_eof(core);
        }
        ControlFlow::Continue(())
    }

    fn close_segmenter(&mut self) {
        if let Some(mut segmenter) = self.segmenter.take() {
            segmenter.close();
        }
    }

    fn send_file_segment(&mut self, core: &mut TransactionCore) -> Flow {
        let Some(segmenter) = self.segmenter.as_mut() else {
            return ControlFlow::Continue(());
        };
        match segmenter.next_segment() {
            Ok(Some(segment)) => {
                self.checksum.update(segment.offset, &segment.data);
                let end = segment.offset + segment.data.len() as u64;
                let pdu = core.build_pdu(PduPayload::FileData(FileDataPdu {
                    offset: segment.offset,
                    data: segment.data,
                    segment_metadata: segment.segment_metadata,
                }));
                // Lost file data is recovered by the NAK procedure in acknowledged mode.
                let _ = core.send_pdu(&pdu);
                if core.is_acknowledged() {
                    if let PduPayload::FileData(file_data) = pdu.payload {
                        self.sent_file_data.push(file_data);
                    }
                }
                core.set_progress(core.progress().max(end));
                ControlFlow::Continue(())
            }
            Ok(None) => {
                self.close_segmenter();
                self.send_eof(core)
            }
            Err(e) => {
                log::error!("transaction {}: reading file segment failed: {}", core.id, e);
                core.declare_fault(ConditionCode::InvalidFileStructure)?;
                self.close_segmenter();
                self.send_eof(core)
            }
        }
    }

    fn send_eof(&mut self, core: &mut TransactionCore) -> Flow {
        let eof = EofPdu {
            condition_code: ConditionCode::NoError,
            checksum: self.checksum.value(),
            file_size: core.progress(),
            fault_location: None,
        };
        if core.is_acknowledged() {
            let _ = core.send_acknowledged(PduPayload::Eof(eof));
            core.emit(Indication::EofSent(core.id));
            self.phase = Phase::AwaitingFinished;
            return ControlFlow::Continue(());
        }
        let _ = core.send(PduPayload::Eof(eof));
        core.emit(Indication::EofSent(core.id));
        if self.closure_requested {
            self.phase = Phase::AwaitingClosure;
            core.start_timer(TimerRole::Check, core.remote_cfg.check_timer_interval);
        } else {
            self.complete(
                core,
                ConditionCode::NoError,
                DeliveryCode::Complete,
                FileStatus::Unreported,
                Vec::new(),
            );
        }
        ControlFlow::Continue(())
    }

    /// Notice of completion.
    fn complete(
        &mut self,
        core: &mut TransactionCore,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
        fs_responses: Vec<FilestoreResponse>,
    ) {
        self.close_segmenter();
        self.phase = Phase::Done;
        core.clear_pending_ack();
        core.cancel_all_timers();
        core.set_condition_code(condition_code);
        core.set_state(if condition_code == ConditionCode::NoError {
            crate::TransactionState::Completed
        } else {
            crate::TransactionState::Cancelled
        });
        core.emit(Indication::TransactionFinished(TransactionFinishedParams {
            id: core.id,
            condition_code,
            delivery_code,
            file_status,
            fs_responses,
        }));
        core.request_dispose();
    }

    fn finished_received(&mut self, core: &mut TransactionCore, finished: FinishedPdu) -> Flow {
        if core.is_acknowledged() {
            let transaction_status = if core.state().is_terminal() {
                TransactionStatus::Terminated
            } else {
                TransactionStatus::Active
            };
            let _ = core.send(PduPayload::Ack(AckPdu {
                directive: FileDirectiveType::FinishedPdu,
                condition_code: finished.condition_code,
                transaction_status,
            }));
        } else if !self.closure_requested {
            log::warn!(
                "transaction {}: unexpected Finished PDU without closure",
                core.id
            );
        }
        if core.in_cleanup() {
            core.clear_pending_ack();
            core.request_dispose();
            return ControlFlow::Continue(());
        }
        self.complete(
            core,
            finished.condition_code,
            finished.delivery_code,
            finished.file_status,
            finished.fs_responses,
        );
        ControlFlow::Continue(())
    }

    fn nak_received(&mut self, core: &mut TransactionCore, nak: NakPdu) -> Flow {
        if !core.is_acknowledged() {
            log::warn!("transaction {}: NAK in unacknowledged mode", core.id);
            return ControlFlow::Continue(());
        }
        if !core.may_transmit() {
            log::debug!("transaction {}: ignoring NAK", core.id);
            return ControlFlow::Continue(());
        }
        let mut resend = BTreeSet::new();
        let mut resend_metadata = false;
        for (start, end) in nak.segment_requests.iter().copied() {
            if (start, end) == (0, 0) {
                resend_metadata |= nak.start_of_scope == 0;
                continue;
            }
            resend.extend(
                self.sent_file_data
                    .iter()
                    .enumerate()
                    .filter(|(_, file_data)| file_data.overlaps(start, end))
                    .map(|(idx, _)| idx),
            );
        }
        log::debug!(
            "transaction {}: NAK requests {} segments{}",
            core.id,
            resend.len(),
            if resend_metadata { " and metadata" } else { "" }
        );
        if resend_metadata {
            if let Some(metadata) = &self.metadata {
                let _ = core.send(PduPayload::Metadata(metadata.clone()));
            }
        }
        for idx in resend {
            let _ = core.send(PduPayload::FileData(self.sent_file_data[idx].clone()));
        }
        ControlFlow::Continue(())
    }
}

impl RoleHooks for OutgoingTransaction {
    fn activate(&mut self, core: &mut TransactionCore) -> Flow {
        core.emit(Indication::TransactionStarted(core.id));
        if core.is_acknowledged() {
            core.start_timer(TimerRole::Inactivity, core.remote_cfg.inactivity_timeout);
        }
        let filestore = core.env.filestore.clone();
        if let Some(source_file) = self.put.source_file() {
            match filestore.file_size(source_file) {
                Ok(file_size) => self.file_size = Some(file_size),
                Err(e) => {
                    log::error!(
                        "transaction {}: can not access {}: {}",
                        core.id,
                        source_file,
                        e
                    );
                    core.declare_fault(ConditionCode::FilestoreRejection)?;
                }
            }
        }
        core.set_file_size(self.file_size.unwrap_or(0));
        self.phase = Phase::SendingFileData;
        let (Some(source_file), Some(_)) = (self.put.source_file(), self.file_size) else {
            return self.start_transmission(core);
        };
        let selection = match core.env.segmentation.select(
            &core.env.local_cfg,
            filestore,
            source_file,
            core.remote_cfg.max_file_segment_len,
            self.put.record_boundaries_requested(),
        ) {
            Ok(selection) => selection,
            Err(e) => {
                log::error!(
                    "transaction {}: can not segment {}: {}",
                    core.id,
                    source_file,
                    e
                );
                core.declare_fault(ConditionCode::FilestoreRejection)?;
                return self.start_transmission(core);
            }
        };
        self.segmenter = Some(selection.segmenter);
        if selection.record_boundaries_unsupported {
            core.declare_fault(ConditionCode::InvalidFileStructure)?;
        }
        self.start_transmission(core)
    }

    fn indication(&mut self, core: &mut TransactionCore, pdu: Pdu) -> Flow {
        match pdu.payload {
            PduPayload::Finished(finished) => self.finished_received(core, finished),
            PduPayload::Ack(ack) if ack.directive == FileDirectiveType::EofPdu => {
                if core.ack_received(&ack) && core.in_cleanup() {
                    core.request_dispose();
                }
                ControlFlow::Continue(())
            }
            PduPayload::Nak(nak) => self.nak_received(core, nak),
            PduPayload::KeepAlive(KeepAlivePdu { progress }) => {
                let discrepancy = core.progress().saturating_sub(progress);
                if discrepancy > core.remote_cfg.keep_alive_discrepancy_limit {
                    log::warn!(
                        "transaction {}: receiver progress {} lags by {} bytes",
                        core.id,
                        progress,
                        discrepancy
                    );
                    return core.declare_fault(ConditionCode::KeepAliveLimitReached);
                }
                ControlFlow::Continue(())
            }
            payload => {
                log::warn!(
                    "transaction {}: unexpected {:?} PDU at the sender",
                    core.id,
                    payload.directive_type()
                );
                ControlFlow::Continue(())
            }
        }
    }

    fn timer_expired(&mut self, core: &mut TransactionCore, role: TimerRole) -> Flow {
        if role != TimerRole::Check || self.phase != Phase::AwaitingClosure {
            log::debug!("transaction {}: ignoring {:?} timer", core.id, role);
            return ControlFlow::Continue(());
        }
        self.check_count += 1;
        if self.check_count < core.remote_cfg.check_limit {
            core.start_timer(TimerRole::Check, core.remote_cfg.check_timer_interval);
            return ControlFlow::Continue(());
        }
        core.declare_fault(ConditionCode::CheckLimitReached)?;
        // The closure is given up once the check limit fault is ignored.
        self.complete(
            core,
            ConditionCode::NoError,
            DeliveryCode::Complete,
            FileStatus::Unreported,
            Vec::new(),
        );
        ControlFlow::Continue(())
    }

    fn cancel(&mut self, core: &mut TransactionCore, code: ConditionCode) -> Flow {
        self.close_segmenter();
        self.phase = Phase::Done;
        core.emit(Indication::TransactionFinished(TransactionFinishedParams {
            id: core.id,
            condition_code: code,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::Unreported,
            fs_responses: Vec::new(),
        }));
        let eof = PduPayload::Eof(EofPdu {
            condition_code: code,
            checksum: self.checksum.value(),
            file_size: core.progress(),
            fault_location: Some(core.local_id),
        });
        let sent = if core.is_acknowledged() {
            core.send_acknowledged(eof)
        } else {
            core.send(eof)
        };
        if sent.is_err() {
            return ControlFlow::Break(FaultOutcome::Abandonment(code));
        }
        core.emit(Indication::EofSent(core.id));
        if !core.is_acknowledged() {
            core.request_dispose();
        }
        ControlFlow::Continue(())
    }

    fn keep_alive_request(&mut self, core: &mut TransactionCore) -> Flow {
        if core.is_acknowledged() && core.may_transmit() {
            let _ = core.send(PduPayload::Prompt(PromptPdu {
                response: PromptResponse::KeepAlive,
            }));
        }
        ControlFlow::Continue(())
    }

    fn prompt_nak_request(&mut self, core: &mut TransactionCore) -> Flow {
        if core.is_acknowledged() && core.may_transmit() {
            let _ = core.send(PduPayload::Prompt(PromptPdu {
                response: PromptResponse::Nak,
            }));
        }
        ControlFlow::Continue(())
    }

    fn unpaused(&mut self, core: &mut TransactionCore) -> Flow {
        self.start_transmission(core)
    }

    fn has_pending_work(&self, core: &TransactionCore) -> bool {
        self.phase == Phase::SendingFileData
            && self.metadata_sent
            && self.segmenter.is_some()
            && core.may_transmit()
    }

    fn pump(&mut self, core: &mut TransactionCore) -> Flow {
        self.send_file_segment(core)
    }

    fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    fn pre_dispose(&mut self, _core: &mut TransactionCore) {
        self.close_segmenter();
        self.sent_file_data.clear();
    }
}
