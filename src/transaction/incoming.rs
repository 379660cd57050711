//! Receiving side of a file copy operation.
//!
//! File data is written into a staging file inside the configured staging directory. Once the
//! metadata, the EOF and all file data up to the declared size are present, the staging file is
//! verified against the EOF checksum and moved to its destination.
use core::ops::ControlFlow;

use spacepackets::cfdp::{
    pdu::{
        finished::{DeliveryCode, FileStatus},
        FileDirectiveType,
    },
    TransactionStatus,
};
use spacepackets::util::UnsignedEnum;

use super::{reconstruction::ReconstructionMap, RoleHooks, TransactionCore};
use crate::{
    checksum::supported_checksum_type,
    fault::{FaultOutcome, Flow},
    filestore::{execute_filestore_requests, FilestoreError, FilestoreResponse},
    pdu::{
        AckPdu, EofPdu, FileDataPdu, FinishedPdu, KeepAlivePdu, MetadataPdu, NakPdu, Pdu,
        PduPayload, PromptPdu, PromptResponse,
    },
    timer::TimerRole,
    user::{FileSegmentRecvParams, Indication, MetadataRecvParams, TransactionFinishedParams},
    ChecksumType, ConditionCode, TransactionState,
};

/// Extension of retained, incompletely received files.
pub const INCOMPLETE_FILE_SUFFIX: &str = ".part";

const CHECKSUM_BUF_LEN: usize = 4096;

pub(crate) struct IncomingTransaction {
    metadata: Option<MetadataPdu>,
    checksum_type: ChecksumType,
    checksum_unsupported: bool,
    staging_file: String,
    staging_created: bool,
    extents: ReconstructionMap,
    eof: Option<EofPdu>,
    pdu_received: bool,
    reconstructed: bool,
    data_complete: bool,
    persisted: bool,
    nak_count: u32,
    check_count: u32,
}

impl IncomingTransaction {
    pub fn new(core: &TransactionCore) -> Self {
        let staging_file = core
            .env
            .local_cfg
            .staging_dir
            .join(format!(
                "cfdp-{}-{}{}",
                core.id.source_id().value(),
                core.id.seq_num().value(),
                INCOMPLETE_FILE_SUFFIX
            ))
            .to_string_lossy()
            .into_owned();
        Self {
            metadata: None,
            checksum_type: ChecksumType::NullChecksum,
            checksum_unsupported: false,
            staging_file,
            staging_created: false,
            extents: ReconstructionMap::default(),
            eof: None,
            pdu_received: false,
            reconstructed: false,
            data_complete: false,
            persisted: false,
            nak_count: 0,
            check_count: 0,
        }
    }

    fn closure_requested(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|metadata| metadata.closure_requested)
    }

    fn declared_file_size(&self) -> Option<u64> {
        self.eof
            .map(|eof| eof.file_size)
            .or(self.metadata.as_ref().map(|metadata| metadata.file_size))
    }

    fn update_progress(&self, core: &mut TransactionCore) {
        let contiguous = self.extents.contiguous();
        core.set_progress(match self.eof {
            Some(eof) => contiguous.min(eof.file_size),
            None => contiguous,
        });
    }

    fn ensure_staging_file(&mut self, core: &TransactionCore) -> Result<(), FilestoreError> {
        if !self.staging_created {
            if !core.env.filestore.exists(&self.staging_file)? {
                core.env.filestore.create_file(&self.staging_file)?;
            }
            self.staging_created = true;
        }
        Ok(())
    }

    fn metadata_received(&mut self, core: &mut TransactionCore, metadata: MetadataPdu) -> Flow {
        if self.metadata.is_some() {
            log::debug!("transaction {}: duplicate metadata", core.id);
            return ControlFlow::Continue(());
        }
        core.fault_handlers
            .apply_overrides(metadata.options.fault_handler_overrides.iter());
        if self.eof.is_none() {
            core.set_file_size(metadata.file_size);
        }
        core.emit(Indication::MetadataReceived(MetadataRecvParams {
            id: core.id,
            source_id: *core.id.source_id(),
            file_size: metadata.file_size,
            source_file: metadata.source_file.clone(),
            dest_file: metadata.dest_file.clone(),
            msgs_to_user: metadata.options.msgs_to_user.clone(),
        }));
        let raw_checksum_type = metadata.checksum_type;
        self.metadata = Some(metadata);
        match supported_checksum_type(raw_checksum_type) {
            Some(checksum_type) => self.checksum_type = checksum_type,
            None => {
                log::warn!(
                    "transaction {}: unsupported checksum type {}",
                    core.id,
                    raw_checksum_type
                );
                self.checksum_type = ChecksumType::NullChecksum;
                self.checksum_unsupported = true;
                core.declare_fault(ConditionCode::UnsupportedChecksumType)?;
            }
        }
        self.try_complete(core)
    }

    fn file_data_received(
        &mut self,
        core: &mut TransactionCore,
        file_data: FileDataPdu,
        first_pdu: bool,
    ) -> Flow {
        let immediate_nak = core.is_acknowledged() && core.remote_cfg.immediate_nak_mode;
        let len = file_data.data.len() as u64;
        let Some(end) = file_data.end() else {
            log::warn!(
                "transaction {}: file data at offset {} ends beyond the largest file size",
                core.id,
                file_data.offset
            );
            return core.declare_fault(ConditionCode::FileSizeError);
        };
        if self.extents.covers(file_data.offset, len) {
            log::debug!(
                "transaction {}: duplicate file data at offset {}",
                core.id,
                file_data.offset
            );
            return ControlFlow::Continue(());
        }
        let written = self.ensure_staging_file(core).and_then(|_| {
            core.env
                .filestore
                .write_data(&self.staging_file, file_data.offset, &file_data.data)
        });
        if let Err(e) = written {
            log::error!(
                "transaction {}: writing {} failed: {}",
                core.id,
                self.staging_file,
                e
            );
            return core.declare_fault(ConditionCode::FilestoreRejection);
        }
        self.extents.insert(file_data.offset, len);
        self.update_progress(core);
        core.emit(Indication::FileSegmentReceived(FileSegmentRecvParams {
            id: core.id,
            offset: file_data.offset,
            length: file_data.data.len(),
            record_continuation_state: file_data
                .segment_metadata
                .as_ref()
                .map(|meta| meta.record_continuation_state),
        }));
        if let Some(eof) = self.eof {
            if end > eof.file_size {
                core.declare_fault(ConditionCode::FileSizeError)?;
            }
        }
        if immediate_nak {
            if first_pdu {
                // File data came first, so the metadata was lost.
                self.send_nak_sequence(core);
            } else if self.eof.is_none()
                && self.extents.gap_detected()
                && !core.timer_active(TimerRole::NakRecompute)
            {
                core.start_timer(
                    TimerRole::NakRecompute,
                    core.remote_cfg.nak_recomputation_interval,
                );
            }
        }
        self.try_complete(core)
    }

    fn eof_received(&mut self, core: &mut TransactionCore, eof: EofPdu) -> Flow {
        if core.is_acknowledged() {
            let transaction_status = if core.state().is_terminal() {
                TransactionStatus::Terminated
            } else {
                TransactionStatus::Active
            };
            let _ = core.send(PduPayload::Ack(AckPdu {
                directive: FileDirectiveType::EofPdu,
                condition_code: eof.condition_code,
                transaction_status,
            }));
        }
        if core.in_cleanup() {
            return ControlFlow::Continue(());
        }
        if eof.condition_code != ConditionCode::NoError {
            self.sender_cancelled(core, eof.condition_code);
            return ControlFlow::Continue(());
        }
        if self.eof.is_some() {
            log::debug!("transaction {}: duplicate EOF", core.id);
            return ControlFlow::Continue(());
        }
        self.eof = Some(eof);
        core.set_file_size(eof.file_size);
        self.update_progress(core);
        core.cancel_timer(TimerRole::KeepAlive);
        core.cancel_timer(TimerRole::NakRecompute);
        core.emit(Indication::EofReceived(core.id));
        if self.extents.received_end() > eof.file_size {
            log::warn!(
                "transaction {}: received {} bytes, EOF declares {}",
                core.id,
                self.extents.received_end(),
                eof.file_size
            );
            core.declare_fault(ConditionCode::FileSizeError)?;
        }
        self.try_complete(core)?;
        if self.reconstructed {
            return ControlFlow::Continue(());
        }
        if core.is_acknowledged() {
            self.send_nak_sequence(core);
            self.nak_count = 0;
            core.start_periodic_timer(TimerRole::Nak, core.remote_cfg.nak_timer_interval);
        } else {
            core.start_timer(TimerRole::Check, core.remote_cfg.check_timer_interval);
        }
        ControlFlow::Continue(())
    }

    /// The sender cancelled the transaction with an EOF PDU. No Finished PDU is sent.
    fn sender_cancelled(&mut self, core: &mut TransactionCore, code: ConditionCode) {
        log::info!("transaction {}: cancelled by the sender with {:?}", core.id, code);
        core.cancel_all_timers();
        core.clear_pending_ack();
        let file_status = self.handle_incomplete_file(core);
        core.set_condition_code(code);
        core.set_state(TransactionState::Cancelled);
        core.emit(Indication::TransactionFinished(TransactionFinishedParams {
            id: core.id,
            condition_code: code,
            delivery_code: DeliveryCode::Incomplete,
            file_status,
            fs_responses: Vec::new(),
        }));
        core.request_dispose();
    }

    /// Completes the transaction once all parts of the file are present. Repeated calls after the
    /// completion have no effect.
    fn try_complete(&mut self, core: &mut TransactionCore) -> Flow {
        if self.reconstructed {
            return ControlFlow::Continue(());
        }
        let (Some(metadata), Some(eof)) = (self.metadata.as_ref(), self.eof) else {
            return ControlFlow::Continue(());
        };
        if self.extents.contiguous() < eof.file_size {
            return ControlFlow::Continue(());
        }
        self.reconstructed = true;
        let dest_file = metadata.dest_file.clone();
        let fs_requests = metadata.options.fs_requests.clone();
        for role in [
            TimerRole::Nak,
            TimerRole::NakRecompute,
            TimerRole::Check,
            TimerRole::KeepAlive,
        ] {
            core.cancel_timer(role);
        }
        let mut delivery_code = DeliveryCode::Complete;
        let mut file_status = FileStatus::Unreported;
        self.data_complete = dest_file.is_none();
        if let Some(dest_file) = dest_file {
            match self.verify_checksum(core, eof) {
                Ok(true) => {
                    self.data_complete = true;
                    file_status = FileStatus::Retained;
                }
                Ok(false) => {
                    log::warn!(
                        "transaction {}: checksum mismatch, expected {:#010x}",
                        core.id,
                        eof.checksum
                    );
                    core.declare_fault(ConditionCode::FileChecksumFailure)?;
                    delivery_code = DeliveryCode::Incomplete;
                    file_status = FileStatus::Retained;
                }
                Err(e) => {
                    log::error!("transaction {}: checksum calculation failed: {}", core.id, e);
                    delivery_code = DeliveryCode::Incomplete;
                    file_status = FileStatus::DiscardedFsRejection;
                }
            }
            if file_status == FileStatus::Retained {
                if let Err(e) = self.persist(core, &dest_file) {
                    log::error!(
                        "transaction {}: storing {} failed: {}",
                        core.id,
                        dest_file,
                        e
                    );
                    file_status = FileStatus::DiscardedFsRejection;
                }
            }
            if self.checksum_unsupported && file_status == FileStatus::Retained {
                file_status = FileStatus::Unreported;
            }
        }
        let fs_responses = execute_filestore_requests(core.env.filestore.as_ref(), &fs_requests);
        self.finish(core, delivery_code, file_status, fs_responses)
    }

    fn verify_checksum(
        &mut self,
        core: &TransactionCore,
        eof: EofPdu,
    ) -> Result<bool, FilestoreError> {
        self.ensure_staging_file(core)?;
        if self.checksum_type == ChecksumType::NullChecksum {
            return Ok(true);
        }
        let mut buf = vec![0; CHECKSUM_BUF_LEN];
        core.env.filestore.checksum_verify(
            eof.checksum,
            &self.staging_file,
            self.checksum_type,
            eof.file_size,
            &mut buf,
        )
    }

    fn persist(&mut self, core: &TransactionCore, dest_file: &str) -> Result<(), FilestoreError> {
        let filestore = core.env.filestore.as_ref();
        self.ensure_staging_file(core)?;
        if filestore.exists(dest_file)? {
            filestore.remove_file(dest_file)?;
        }
        filestore.rename_file(&self.staging_file, dest_file)?;
        self.persisted = true;
        Ok(())
    }

    /// Notice of completion.
    fn finish(
        &mut self,
        core: &mut TransactionCore,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
        fs_responses: Vec<FilestoreResponse>,
    ) -> Flow {
        let finished = PduPayload::Finished(FinishedPdu {
            condition_code: ConditionCode::NoError,
            delivery_code,
            file_status,
            fs_responses: fs_responses.clone(),
            fault_location: None,
        });
        core.cancel_all_timers();
        core.set_state(TransactionState::Completed);
        core.emit(Indication::TransactionFinished(TransactionFinishedParams {
            id: core.id,
            condition_code: ConditionCode::NoError,
            delivery_code,
            file_status,
            fs_responses,
        }));
        if core.is_acknowledged() {
            // Disposed once the Finished PDU is acknowledged.
            let _ = core.send_acknowledged(finished);
        } else {
            if self.closure_requested() {
                let _ = core.send(finished);
            }
            core.request_dispose();
        }
        ControlFlow::Continue(())
    }

    /// Retains the incomplete file under the destination name plus [INCOMPLETE_FILE_SUFFIX] if
    /// configured, otherwise discards it.
    fn handle_incomplete_file(&mut self, core: &TransactionCore) -> FileStatus {
        if self.persisted {
            return FileStatus::Retained;
        }
        let dest_file = self
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.dest_file.clone());
        match dest_file {
            Some(dest_file)
                if self.staging_created && core.remote_cfg.retain_incomplete_on_cancellation =>
            {
                match self.retain_incomplete(core, &dest_file) {
                    Ok(()) => FileStatus::Retained,
                    Err(e) => {
                        log::error!(
                            "transaction {}: retaining incomplete file failed: {}",
                            core.id,
                            e
                        );
                        self.discard_staging_file(core);
                        FileStatus::DiscardedFsRejection
                    }
                }
            }
            _ => {
                self.discard_staging_file(core);
                FileStatus::DiscardDeliberately
            }
        }
    }

    fn retain_incomplete(
        &mut self,
        core: &TransactionCore,
        dest_file: &str,
    ) -> Result<(), FilestoreError> {
        let filestore = core.env.filestore.as_ref();
        if let Some(file_size) = self.declared_file_size() {
            // Pad the gaps and the missing tail with zeros.
            if file_size > 0 && filestore.file_size(&self.staging_file)? < file_size {
                filestore.write_data(&self.staging_file, file_size - 1, &[0])?;
            }
        }
        let retained = format!("{}{}", dest_file, INCOMPLETE_FILE_SUFFIX);
        if filestore.exists(&retained)? {
            filestore.remove_file(&retained)?;
        }
        filestore.rename_file(&self.staging_file, &retained)?;
        self.persisted = true;
        log::info!("transaction {}: incomplete file kept as {}", core.id, retained);
        Ok(())
    }

    fn discard_staging_file(&mut self, core: &TransactionCore) {
        if !self.staging_created || self.persisted {
            return;
        }
        self.staging_created = false;
        if let Err(e) = core.env.filestore.remove_file(&self.staging_file) {
            log::warn!(
                "transaction {}: removing {} failed: {}",
                core.id,
                self.staging_file,
                e
            );
        }
    }

    /// Sends the NAK PDUs for all missing data. Metadata is requested with a `(0, 0)` segment
    /// request.
    fn send_nak_sequence(&mut self, core: &mut TransactionCore) {
        if !core.may_transmit() {
            return;
        }
        let declared_size = self.eof.map(|eof| eof.file_size);
        let mut requests = Vec::new();
        if self.metadata.is_none() {
            requests.push((0, 0));
        }
        requests.extend(self.extents.missing(declared_size));
        if requests.is_empty() {
            return;
        }
        let start_of_scope = if self.metadata.is_none() {
            0
        } else {
            self.extents.contiguous()
        };
        let end_of_scope = declared_size.unwrap_or(self.extents.received_end());
        log::debug!(
            "transaction {}: requesting {} missing segments",
            core.id,
            requests.len()
        );
        for nak in NakPdu::batches(start_of_scope, end_of_scope, &requests) {
            let _ = core.send(PduPayload::Nak(nak));
        }
    }

    fn send_keep_alive(&self, core: &mut TransactionCore) {
        if core.may_transmit() {
            let _ = core.send(PduPayload::KeepAlive(KeepAlivePdu {
                progress: self.extents.contiguous(),
            }));
        }
    }
}

impl RoleHooks for IncomingTransaction {
    fn activate(&mut self, core: &mut TransactionCore) -> Flow {
        core.start_timer(TimerRole::Inactivity, core.remote_cfg.inactivity_timeout);
        if core.is_acknowledged() {
            core.start_periodic_timer(TimerRole::KeepAlive, core.remote_cfg.keep_alive_interval);
        }
        ControlFlow::Continue(())
    }

    fn indication(&mut self, core: &mut TransactionCore, pdu: Pdu) -> Flow {
        let first_pdu = !self.pdu_received;
        self.pdu_received = true;
        if core.in_cleanup() && !matches!(pdu.payload, PduPayload::Eof(_) | PduPayload::Ack(_)) {
            log::debug!("transaction {}: closing, ignoring {}", core.id, pdu);
            return ControlFlow::Continue(());
        }
        match pdu.payload {
            PduPayload::Metadata(metadata) => self.metadata_received(core, metadata),
            PduPayload::FileData(file_data) => self.file_data_received(core, file_data, first_pdu),
            PduPayload::Eof(eof) => self.eof_received(core, eof),
            PduPayload::Ack(ack) if ack.directive == FileDirectiveType::FinishedPdu => {
                if core.ack_received(&ack) {
                    core.request_dispose();
                }
                ControlFlow::Continue(())
            }
            PduPayload::Prompt(PromptPdu { response }) => {
                if !core.is_acknowledged() {
                    return ControlFlow::Continue(());
                }
                match response {
                    PromptResponse::Nak => {
                        self.send_nak_sequence(core);
                        core.restart_timer(TimerRole::NakRecompute);
                    }
                    PromptResponse::KeepAlive => self.send_keep_alive(core),
                }
                ControlFlow::Continue(())
            }
            payload => {
                log::warn!(
                    "transaction {}: unexpected {:?} PDU at the receiver",
                    core.id,
                    payload.directive_type()
                );
                ControlFlow::Continue(())
            }
        }
    }

    fn timer_expired(&mut self, core: &mut TransactionCore, role: TimerRole) -> Flow {
        match role {
            TimerRole::Nak => {
                if self.nak_count >= core.remote_cfg.nak_timer_expiration_limit {
                    core.cancel_timer(TimerRole::Nak);
                    return core.declare_fault(ConditionCode::NakLimitReached);
                }
                self.nak_count += 1;
                self.send_nak_sequence(core);
            }
            TimerRole::NakRecompute => {
                if self.eof.is_none() {
                    self.send_nak_sequence(core);
                }
            }
            TimerRole::Check => {
                self.check_count += 1;
                if self.check_count >= core.remote_cfg.check_limit {
                    return core.declare_fault(ConditionCode::CheckLimitReached);
                }
                core.start_timer(TimerRole::Check, core.remote_cfg.check_timer_interval);
            }
            TimerRole::KeepAlive => self.send_keep_alive(core),
            TimerRole::Inactivity | TimerRole::PositiveAck => (),
        }
        ControlFlow::Continue(())
    }

    fn cancel(&mut self, core: &mut TransactionCore, code: ConditionCode) -> Flow {
        let file_status = self.handle_incomplete_file(core);
        let delivery_code = if self.data_complete {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        };
        core.emit(Indication::TransactionFinished(TransactionFinishedParams {
            id: core.id,
            condition_code: code,
            delivery_code,
            file_status,
            fs_responses: Vec::new(),
        }));
        let finished = PduPayload::Finished(FinishedPdu {
            condition_code: code,
            delivery_code,
            file_status,
            fs_responses: Vec::new(),
            fault_location: Some(core.local_id),
        });
        if core.is_acknowledged() {
            let _ = core.send_acknowledged(finished);
            return ControlFlow::Continue(());
        }
        core.request_dispose();
        if self.closure_requested() && core.send(finished).is_err() {
            return ControlFlow::Break(FaultOutcome::Abandonment(code));
        }
        ControlFlow::Continue(())
    }

    fn keep_alive_request(&mut self, core: &mut TransactionCore) -> Flow {
        if core.is_acknowledged() {
            self.send_keep_alive(core);
        }
        ControlFlow::Continue(())
    }

    fn prompt_nak_request(&mut self, core: &mut TransactionCore) -> Flow {
        if core.is_acknowledged() {
            self.send_nak_sequence(core);
        }
        ControlFlow::Continue(())
    }

    /// Repeats the NAK sequence which was held back while the transaction was paused. The NAK
    /// timer restarts on its own and keeps its expiration count.
    fn unpaused(&mut self, core: &mut TransactionCore) -> Flow {
        if core.is_acknowledged() && self.eof.is_some() && !self.reconstructed {
            self.send_nak_sequence(core);
        }
        ControlFlow::Continue(())
    }

    fn file_size(&self) -> Option<u64> {
        self.declared_file_size()
    }

    fn pre_dispose(&mut self, core: &mut TransactionCore) {
        self.discard_staging_file(core);
    }
}
