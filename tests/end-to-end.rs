//! End-to-end integration tests: two entities connected through a loopback transport perform
//! file copy operations.
use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Once},
    time::Duration,
};

use cfdp_engine::{
    entity::Entity,
    filestore::NativeFilestore,
    pdu::{Pdu, PduPayload},
    request::{PutRequest, Request},
    segmenter::SegmentationChain,
    transport::{LoopbackTransport, TransportBinding},
    user::{channel_subscriber, Indication, TransactionFinishedParams},
    ChecksumType, ConditionCode, FaultHandlerCode, FaultHandlerMap, IndicationConfig,
    LocalEntityConfig, RemoteEntityConfig, TransactionId, TransactionState, TransmissionMode,
};
use rand::RngCore;
use spacepackets::{
    cfdp::pdu::finished::{DeliveryCode, FileStatus},
    util::{UnsignedByteFieldU16, UnsignedEnum},
};
use tempfile::TempDir;

const SENDER_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const RECEIVER_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

/// One second of the default timer profile lasts this long.
const TIMER_SCALE: Duration = Duration::from_millis(50);
const SEGMENT_LEN: usize = 1024;
const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%H:%M:%S%.3f]"),
                    std::thread::current().name().unwrap_or("unnamed"),
                    record.level(),
                    message
                ))
            })
            .level(LOG_LEVEL)
            .chain(std::io::stdout())
            .apply();
    });
}

struct Node {
    entity: Entity,
    transport: Arc<LoopbackTransport>,
    indications: mpsc::Receiver<Indication>,
    staging_dir: TempDir,
}

impl Node {
    fn new(
        id: UnsignedByteFieldU16,
        peer_id: UnsignedByteFieldU16,
        transport: Arc<LoopbackTransport>,
        trans_mode: TransmissionMode,
        closure_requested: bool,
        fault_handlers: FaultHandlerMap,
    ) -> Self {
        let staging_dir = tempfile::tempdir().expect("creating staging directory failed");
        let local_cfg = LocalEntityConfig::new(id.into(), IndicationConfig::default(), fault_handlers)
            .with_staging_dir(staging_dir.path());
        let remote_cfg = RemoteEntityConfig::new_with_default_values(
            peer_id.into(),
            SEGMENT_LEN,
            closure_requested,
            false,
            trans_mode,
            ChecksumType::Crc32,
        )
        .with_timer_scale(TIMER_SCALE);
        let entity = Entity::new(
            local_cfg,
            remote_cfg,
            vec![transport.clone() as Arc<dyn TransportBinding>],
            Arc::new(NativeFilestore::default()),
            SegmentationChain::default(),
        )
        .expect("creating entity failed");
        let (tx, indications) = mpsc::channel();
        entity.subscribe(channel_subscriber(tx));
        Self {
            entity,
            transport,
            indications,
            staging_dir,
        }
    }

    fn next_indication(&self) -> Indication {
        self.indications
            .recv_timeout(Duration::from_secs(10))
            .expect("no indication within 10 seconds")
    }

    /// Collects the indications of a transaction up to and including its disposal.
    fn until_disposed(&self) -> Vec<Indication> {
        let mut indications = Vec::new();
        loop {
            let indication = self.next_indication();
            log::info!("entity {}: {:?}", self.entity.id().value(), indication);
            let done = matches!(indication, Indication::TransactionDisposed { .. });
            indications.push(indication);
            if done {
                return indications;
            }
        }
    }

    fn wait_for(&self, mut predicate: impl FnMut(&Indication) -> bool) -> Vec<Indication> {
        let mut indications = Vec::new();
        loop {
            let indication = self.next_indication();
            let done = predicate(&indication);
            indications.push(indication);
            if done {
                return indications;
            }
        }
    }

    fn staging_dir_is_empty(&self) -> bool {
        std::fs::read_dir(self.staging_dir.path())
            .expect("reading staging directory failed")
            .next()
            .is_none()
    }
}

struct Link {
    sender: Node,
    receiver: Node,
    workdir: TempDir,
    source: PathBuf,
    dest: PathBuf,
    data: Vec<u8>,
}

impl Link {
    fn new(trans_mode: TransmissionMode, closure_requested: bool, file_len: usize) -> Self {
        init_logger();
        let (sender_transport, receiver_transport) = LoopbackTransport::pair(SENDER_ID, RECEIVER_ID);
        let sender = Node::new(
            SENDER_ID,
            RECEIVER_ID,
            sender_transport,
            trans_mode,
            closure_requested,
            FaultHandlerMap::default(),
        );
        let receiver = Node::new(
            RECEIVER_ID,
            SENDER_ID,
            receiver_transport,
            trans_mode,
            closure_requested,
            FaultHandlerMap::default(),
        );
        let workdir = tempfile::tempdir().expect("creating temp directory failed");
        let source = workdir.path().join("source.bin");
        let mut data = vec![0; file_len];
        rand::thread_rng().fill_bytes(&mut data);
        std::fs::write(&source, &data).expect("writing source file failed");
        let dest = workdir.path().join("dest.bin");
        Self {
            sender,
            receiver,
            workdir,
            source,
            dest,
            data,
        }
    }

    fn put(&self, trans_mode: TransmissionMode) -> TransactionId {
        self.sender
            .entity
            .put(file_put(&self.source, &self.dest, trans_mode))
            .expect("put request failed")
    }
}

fn file_put(source: &Path, dest: &Path, trans_mode: TransmissionMode) -> PutRequest {
    PutRequest::new_regular_request(
        RECEIVER_ID.into(),
        source.to_str().expect("invalid path string"),
        dest.to_str().expect("invalid path string"),
        Some(trans_mode),
        None,
    )
    .expect("put request creation failed")
}

fn finished_params(indications: &[Indication]) -> &TransactionFinishedParams {
    indications
        .iter()
        .find_map(|indication| match indication {
            Indication::TransactionFinished(params) => Some(params),
            _ => None,
        })
        .expect("no transaction finished indication")
}

fn segment_count(indications: &[Indication]) -> usize {
    indications
        .iter()
        .filter(|indication| matches!(indication, Indication::FileSegmentReceived(_)))
        .count()
}

fn is_file_data(pdu: &Pdu) -> bool {
    matches!(pdu.payload, PduPayload::FileData(_))
}

#[test]
fn acknowledged_transfer() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 10 * SEGMENT_LEN);
    let id = link.put(TransmissionMode::Acknowledged);

    let sent = link.sender.until_disposed();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0], Indication::TransactionStarted(id));
    assert_eq!(sent[1], Indication::EofSent(id));
    assert_eq!(
        sent[2],
        Indication::TransactionFinished(TransactionFinishedParams {
            id,
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Complete,
            file_status: FileStatus::Retained,
            fs_responses: Vec::new(),
        })
    );
    assert_eq!(
        sent[3],
        Indication::TransactionDisposed {
            id,
            state: TransactionState::Completed
        }
    );

    let received = link.receiver.until_disposed();
    let Indication::MetadataReceived(metadata) = &received[0] else {
        panic!("expected metadata first, got {:?}", received[0]);
    };
    assert_eq!(metadata.id, id);
    assert_eq!(metadata.source_id.value(), SENDER_ID.value());
    assert_eq!(metadata.file_size, 10 * SEGMENT_LEN as u64);
    assert_eq!(segment_count(&received), 10);
    assert!(received.contains(&Indication::EofReceived(id)));
    assert_eq!(
        finished_params(&received).file_status,
        FileStatus::Retained
    );
    assert_eq!(
        received.last(),
        Some(&Indication::TransactionDisposed {
            id,
            state: TransactionState::Completed
        })
    );

    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);
    assert!(link.receiver.staging_dir_is_empty());
}

fn unacknowledged_transfer(closure_requested: bool) {
    let link = Link::new(TransmissionMode::Unacknowledged, closure_requested, 5000);
    let id = link.put(TransmissionMode::Unacknowledged);

    let sent = link.sender.until_disposed();
    assert_eq!(sent[0], Indication::TransactionStarted(id));
    assert_eq!(sent[1], Indication::EofSent(id));
    let finished = finished_params(&sent);
    assert_eq!(finished.condition_code, ConditionCode::NoError);
    // Without closure the sender never learns about the fate of the file.
    let expected_status = if closure_requested {
        FileStatus::Retained
    } else {
        FileStatus::Unreported
    };
    assert_eq!(finished.file_status, expected_status);

    let received = link.receiver.until_disposed();
    assert_eq!(segment_count(&received), 5);
    assert_eq!(
        finished_params(&received).delivery_code,
        DeliveryCode::Complete
    );
    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);
    assert!(link.receiver.staging_dir_is_empty());
}

#[test]
fn unacknowledged_transfer_no_closure() {
    unacknowledged_transfer(false);
}

#[test]
fn unacknowledged_transfer_with_closure() {
    unacknowledged_transfer(true);
}

#[test]
fn lost_file_data_is_recovered() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 10 * SEGMENT_LEN);
    let mut dropped = false;
    link.sender.transport.set_drop_filter(move |pdu| {
        let drop = !dropped
            && matches!(&pdu.payload, PduPayload::FileData(fd) if fd.offset == 2 * SEGMENT_LEN as u64);
        dropped |= drop;
        drop
    });
    let id = link.put(TransmissionMode::Acknowledged);

    let sent = link.sender.until_disposed();
    assert_eq!(finished_params(&sent).condition_code, ConditionCode::NoError);
    let received = link.receiver.until_disposed();
    assert!(received.contains(&Indication::EofReceived(id)));
    assert_eq!(segment_count(&received), 10);
    assert_eq!(
        finished_params(&received).delivery_code,
        DeliveryCode::Complete
    );
    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);
}

#[test]
fn lost_metadata_is_recovered() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 3 * SEGMENT_LEN);
    let mut dropped = false;
    link.sender.transport.set_drop_filter(move |pdu| {
        let drop = !dropped && matches!(pdu.payload, PduPayload::Metadata(_));
        dropped |= drop;
        drop
    });
    link.put(TransmissionMode::Acknowledged);

    link.sender.until_disposed();
    let received = link.receiver.until_disposed();
    assert!(received
        .iter()
        .any(|indication| matches!(indication, Indication::MetadataReceived(_))));
    assert_eq!(
        finished_params(&received).condition_code,
        ConditionCode::NoError
    );
    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);
}

#[test]
fn cancellation_mid_transfer() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 64 * SEGMENT_LEN);
    // The link loses everything after the first few segments.
    link.sender.transport.set_drop_filter(|pdu| {
        matches!(&pdu.payload, PduPayload::FileData(fd) if fd.offset >= 4 * SEGMENT_LEN as u64)
    });
    let id = link.put(TransmissionMode::Acknowledged);
    link.receiver
        .wait_for(|indication| *indication == Indication::EofReceived(id));
    let status = link.sender.entity.transaction_status(id).expect("transaction is gone");
    assert_eq!(status.state, TransactionState::Running);
    link.sender
        .entity
        .request(Request::Cancel(id))
        .expect("cancel request failed");

    let sent = link.sender.until_disposed();
    assert_eq!(
        finished_params(&sent).condition_code,
        ConditionCode::CancelRequestReceived
    );
    assert_eq!(
        sent.last(),
        Some(&Indication::TransactionDisposed {
            id,
            state: TransactionState::Cancelled
        })
    );

    let received = link.receiver.until_disposed();
    let finished = finished_params(&received);
    assert_eq!(finished.condition_code, ConditionCode::CancelRequestReceived);
    assert_eq!(finished.delivery_code, DeliveryCode::Incomplete);
    assert_eq!(finished.file_status, FileStatus::DiscardDeliberately);
    assert!(!link.dest.exists());
    assert!(link.receiver.staging_dir_is_empty());
}

#[test]
fn unsupported_checksum_is_ignored() {
    let link = Link::new(TransmissionMode::Unacknowledged, true, 2 * SEGMENT_LEN);
    // The receiving end sees a checksum type it does not support, with a fault handler override
    // which ignores the fault.
    let receiver_transport = link.receiver.transport.clone();
    link.sender.transport.set_drop_filter(move |pdu| {
        let PduPayload::Metadata(metadata) = &pdu.payload else {
            return false;
        };
        let mut metadata = metadata.clone();
        metadata.checksum_type = 7;
        metadata
            .options
            .fault_handler_overrides
            .push((ConditionCode::UnsupportedChecksumType, FaultHandlerCode::IgnoreError));
        receiver_transport.inject(Pdu::new(pdu.header, PduPayload::Metadata(metadata)));
        true
    });
    let id = link.put(TransmissionMode::Unacknowledged);

    let received = link.receiver.until_disposed();
    assert_eq!(
        received[1],
        Indication::Fault {
            id,
            condition_code: ConditionCode::UnsupportedChecksumType,
            progress: 0
        }
    );
    let finished = finished_params(&received);
    assert_eq!(finished.condition_code, ConditionCode::NoError);
    assert_eq!(finished.file_status, FileStatus::Unreported);
    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);

    let sent = link.sender.until_disposed();
    assert_eq!(finished_params(&sent).file_status, FileStatus::Unreported);
}

#[test]
fn transfers_in_both_directions() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 4 * SEGMENT_LEN);
    let reverse_source = link.workdir.path().join("reverse-source.bin");
    let reverse_dest = link.workdir.path().join("reverse-dest.bin");
    let mut reverse_data = vec![0; 3 * SEGMENT_LEN + 17];
    rand::thread_rng().fill_bytes(&mut reverse_data);
    std::fs::write(&reverse_source, &reverse_data).unwrap();
    let mut reverse_put = file_put(&reverse_source, &reverse_dest, TransmissionMode::Acknowledged);
    reverse_put.destination_id = SENDER_ID.into();

    let forward = link.put(TransmissionMode::Acknowledged);
    let reverse = link.receiver.entity.put(reverse_put).expect("put request failed");
    assert_eq!(reverse.source_id().value(), RECEIVER_ID.value());

    // Every entity takes part in two transactions, one in each role.
    for node in [&link.sender, &link.receiver] {
        let mut disposed = Vec::new();
        node.wait_for(|indication| {
            if let Indication::TransactionDisposed { id, state } = indication {
                assert_eq!(*state, TransactionState::Completed);
                disposed.push(*id);
            }
            disposed.len() == 2
        });
        assert!(disposed.contains(&forward));
        assert!(disposed.contains(&reverse));
    }
    assert_eq!(std::fs::read(&link.dest).unwrap(), link.data);
    assert_eq!(std::fs::read(&reverse_dest).unwrap(), reverse_data);
}

#[test]
fn entity_disposal_cancels_transfers() {
    let link = Link::new(TransmissionMode::Acknowledged, false, 16 * SEGMENT_LEN);
    link.sender.transport.set_drop_filter(is_file_data);
    let id = link.put(TransmissionMode::Acknowledged);
    link.receiver
        .wait_for(|indication| *indication == Indication::EofReceived(id));
    link.receiver.entity.dispose();
    let received = link
        .receiver
        .wait_for(|indication| *indication == Indication::EntityDisposed);
    assert_eq!(
        finished_params(&received).condition_code,
        ConditionCode::CancelRequestReceived
    );
    assert!(link.receiver.staging_dir_is_empty());
    assert!(!link.dest.exists());
    assert!(link.receiver.entity.transactions().is_empty());
}
