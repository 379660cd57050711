//! Copies a file between two entities which are connected through a lossy loopback link.
use std::{
    path::PathBuf,
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use cfdp_engine::{
    entity::Entity,
    filestore::NativeFilestore,
    pdu::PduPayload,
    request::PutRequest,
    segmenter::SegmentationChain,
    transport::{LoopbackTransport, TransportBinding},
    user::{channel_subscriber, Indication},
    ChecksumType, FaultHandlerMap, IndicationConfig, LocalEntityConfig, RemoteEntityConfig,
    TransmissionMode,
};
use clap::Parser;
use log::{info, warn};
use spacepackets::util::UnsignedByteFieldU16;

const SOURCE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const DEST_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

#[derive(clap::Parser)]
#[command(about = "Copy a file over a lossy in-process CFDP link")]
pub struct Cli {
    /// File to copy. The copy is written next to it with the `copy` extension.
    file: PathBuf,
    #[arg(short, long, help = "Use the acknowledged transmission mode")]
    acknowledged: bool,
    #[arg(short, long, help = "Drop every n-th file data PDU")]
    drop_every: Option<usize>,
    #[arg(short, long, default_value_t = 1024)]
    segment_len: usize,
    #[arg(short, long, help = "Request a transaction closure in unacknowledged mode")]
    closure_requested: bool,
    #[arg(long, default_value_t = 100, help = "Length of one second of protocol time in ms")]
    timer_scale_ms: u64,
}

fn entity(
    id: UnsignedByteFieldU16,
    peer_id: UnsignedByteFieldU16,
    transport: Arc<LoopbackTransport>,
    cli: &Cli,
    trans_mode: TransmissionMode,
) -> Entity {
    let local_cfg = LocalEntityConfig::new(
        id.into(),
        IndicationConfig::default(),
        FaultHandlerMap::default(),
    );
    let remote_cfg = RemoteEntityConfig::new_with_default_values(
        peer_id.into(),
        cli.segment_len,
        cli.closure_requested,
        false,
        trans_mode,
        ChecksumType::Crc32,
    )
    .with_timer_scale(Duration::from_millis(cli.timer_scale_ms));
    Entity::new(
        local_cfg,
        remote_cfg,
        vec![transport as Arc<dyn TransportBinding>],
        Arc::new(NativeFilestore::default()),
        SegmentationChain::default(),
    )
    .expect("creating entity failed")
}

fn main() {
    let cli = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                std::thread::current().name().unwrap_or("unnamed"),
                record.level(),
                message
            ))
        })
        .level(LOG_LEVEL)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let trans_mode = if cli.acknowledged {
        TransmissionMode::Acknowledged
    } else {
        TransmissionMode::Unacknowledged
    };
    let (source_transport, dest_transport) = LoopbackTransport::pair(SOURCE_ID, DEST_ID);
    if let Some(drop_every) = cli.drop_every.filter(|n| *n > 0) {
        let mut file_data_count = 0;
        source_transport.set_drop_filter(move |pdu| {
            if !matches!(pdu.payload, PduPayload::FileData(_)) {
                return false;
            }
            file_data_count += 1;
            file_data_count % drop_every == 0
        });
    }
    let source = entity(SOURCE_ID, DEST_ID, source_transport, &cli, trans_mode);
    let dest = entity(DEST_ID, SOURCE_ID, dest_transport, &cli, trans_mode);
    let (source_tx, source_rx) = mpsc::channel();
    source.subscribe(channel_subscriber(source_tx));
    let (dest_tx, dest_rx) = mpsc::channel();
    dest.subscribe(Box::new(move |indication: &Indication| {
        if let Indication::FileSegmentReceived(params) = indication {
            log::debug!("received {} bytes at {}", params.length, params.offset);
        }
        let _ = dest_tx.send(indication.clone());
    }));

    let dest_file = cli.file.with_extension("copy");
    let put = PutRequest::new_regular_request(
        DEST_ID.into(),
        cli.file.to_str().expect("invalid path string"),
        dest_file.to_str().expect("invalid path string"),
        Some(trans_mode),
        None,
    )
    .expect("put request creation failed");
    let start = Instant::now();
    let id = source.put(put).expect("put request failed");
    info!("started transaction {} in {:?} mode", id, trans_mode);

    let mut finished = [false, false];
    while !finished.iter().all(|done| *done) {
        for (idx, rx) in [&source_rx, &dest_rx].into_iter().enumerate() {
            let Ok(indication) = rx.recv_timeout(Duration::from_millis(10)) else {
                continue;
            };
            match indication {
                Indication::TransactionFinished(params) => {
                    info!("{} finished: {:?}", ["source", "destination"][idx], params);
                }
                Indication::Fault { condition_code, .. } | Indication::Abandoned { condition_code, .. } => {
                    warn!("{} fault: {:?}", ["source", "destination"][idx], condition_code);
                }
                Indication::TransactionDisposed { .. } => finished[idx] = true,
                _ => (),
            }
        }
        if start.elapsed() > Duration::from_secs(300) {
            panic!("file transfer not finished in 5 minutes");
        }
    }
    let status = if std::fs::read(&cli.file).ok() == std::fs::read(&dest_file).ok() {
        "identical"
    } else {
        "different"
    };
    info!(
        "copied {:?} to {:?} in {:?}, files are {}",
        cli.file,
        dest_file,
        start.elapsed(),
        status
    );
}
