//! End-to-end session manager tests against a fake LLRP reader.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tagstream_core::reader::{PowerLevel, Reader, ReaderStatus};
use tagstream_core::{EventBus, TagEvent};
use tagstream_llrp::proto::{
    self, MSG_ADD_ROSPEC, MSG_ADD_ROSPEC_RESPONSE, MSG_ENABLE_ROSPEC, MSG_ENABLE_ROSPEC_RESPONSE,
    MSG_RO_ACCESS_REPORT, MSG_SET_READER_CONFIG, MSG_SET_READER_CONFIG_RESPONSE, MSG_START_ROSPEC,
    MSG_START_ROSPEC_RESPONSE,
};
use tagstream_pipeline::{BusSink, PipelineConfig, ReadDeduplicator, ReadFilter, ReadPipeline};
use tagstream_session::{OverallStatus, SessionManager};

const EPC: &str = "E200123456789012345678A0";

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u16, u32)> {
    let mut raw_header = [0u8; 10];
    stream.read_exact(&mut raw_header).await?;
    let header = proto::decode_header(&raw_header).expect("valid header");
    let mut payload = vec![0u8; header.msg_len as usize - 10];
    stream.read_exact(&mut payload).await?;
    Ok((header.msg_type, header.msg_id))
}

async fn write_frame(stream: &mut TcpStream, msg_type: u16, msg_id: u32, payload: &[u8]) {
    let frame = proto::encode_message(msg_type, msg_id, payload);
    stream.write_all(&frame).await.expect("write frame");
}

async fn serve_connect_sequence(stream: &mut TcpStream) {
    for _ in 0..4 {
        let (msg_type, msg_id) = read_frame(stream).await.expect("config request");
        let response_type = match msg_type {
            MSG_SET_READER_CONFIG => MSG_SET_READER_CONFIG_RESPONSE,
            MSG_ADD_ROSPEC => MSG_ADD_ROSPEC_RESPONSE,
            MSG_ENABLE_ROSPEC => MSG_ENABLE_ROSPEC_RESPONSE,
            MSG_START_ROSPEC => MSG_START_ROSPEC_RESPONSE,
            other => panic!("unexpected configuration message: {other}"),
        };
        write_frame(stream, response_type, msg_id, &proto::status_payload(0, "")).await;
    }
}

fn build_stack() -> (Arc<EventBus>, Arc<ReadPipeline>, Arc<SessionManager>) {
    let bus = Arc::new(EventBus::new(256));
    let pipeline = Arc::new(ReadPipeline::new(
        PipelineConfig {
            batch_timeout: Duration::from_millis(20),
            health_interval: Duration::from_millis(200),
            ..PipelineConfig::default()
        },
        ReadFilter::new(0.7, 100).unwrap(),
        ReadDeduplicator::new(5.0, 3.0, 10_000).unwrap(),
        Arc::new(BusSink::new(Arc::clone(&bus))),
    ));
    pipeline.start();
    let manager = SessionManager::new(Arc::clone(&pipeline), Some(Arc::clone(&bus)));
    (bus, pipeline, manager)
}

#[tokio::test]
async fn test_register_stream_and_deregister() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let reader_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect_sequence(&mut stream).await;

        let report = proto::tag_report_payload(&[(EPC, Some(-30))]);
        write_frame(&mut stream, MSG_RO_ACCESS_REPORT, 50, &report).await;

        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    });

    let (bus, pipeline, manager) = build_stack();
    let mut events = bus.subscribe();

    let reader = Reader::new("dock-1", Ipv4Addr::LOCALHOST, port, PowerLevel::Medium, 1000)
        .unwrap();
    let reader_id = reader.id.clone();

    let state = manager.register(reader).await.expect("registration");
    assert_eq!(state.status, ReaderStatus::Online);
    assert_eq!(state.status_history.len(), 2);

    // The registration emitted an OFFLINE -> ONLINE status event.
    match events.recv().await.unwrap() {
        TagEvent::ReaderStatusChange {
            old_status,
            new_status,
            ..
        } => {
            assert_eq!(old_status, ReaderStatus::Offline);
            assert_eq!(new_status, ReaderStatus::Online);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The report flows through micro-batching and the pipeline to the bus.
    let clean = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let TagEvent::CleanRead(read) = events.recv().await.unwrap() {
                return read;
            }
        }
    })
    .await
    .expect("clean read within deadline");
    assert_eq!(clean.rfid_tag, EPC);
    assert_eq!(clean.reader_id, reader_id);
    assert!(clean.is_processed);

    // Health metrics picked up the ingest totals.
    let health = manager.health(&reader_id).await.unwrap();
    assert!(health.is_online);
    assert_eq!(health.metrics.total_reads, 1);

    let service = manager.health_all().await;
    assert_eq!(service.overall, OverallStatus::Healthy);
    assert_eq!(service.active_readers, 1);

    manager.deregister(&reader_id).await.unwrap();
    assert!(manager.reader_state(&reader_id).await.is_err());

    pipeline.stop().await;
    reader_task.await.unwrap();
}

#[tokio::test]
async fn test_session_error_triggers_backoff_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let reader_task = tokio::spawn(async move {
        // First session: configure, then hang up to force a transport
        // error in the adapter.
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect_sequence(&mut stream).await;
        drop(stream);

        // Second session: the supervisor reconnects after backoff.
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect_sequence(&mut stream).await;
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    });

    let (_bus, pipeline, manager) = build_stack();
    let reader = Reader::new("flaky", Ipv4Addr::LOCALHOST, port, PowerLevel::Low, 1000).unwrap();
    let reader_id = reader.id.clone();
    manager.register(reader).await.expect("registration");

    // Base delay 1s with jitter; allow a generous window for the
    // ERROR -> OFFLINE -> ONLINE recovery chain to land.
    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = manager.reader_state(&reader_id).await.unwrap();
            let reconnected = state
                .status_history
                .iter()
                .any(|entry| entry.reason == "Reconnecting");
            if reconnected && state.status == ReaderStatus::Online {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("reader recovered within deadline");

    // History: init, ONLINE, ERROR, OFFLINE (reconnecting), ONLINE.
    let statuses: Vec<ReaderStatus> = recovered
        .status_history
        .iter()
        .map(|entry| entry.new_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ReaderStatus::Offline,
            ReaderStatus::Online,
            ReaderStatus::Error,
            ReaderStatus::Offline,
            ReaderStatus::Online,
        ]
    );
    assert_eq!(recovered.health_metrics.error_count, 1);

    manager.shutdown().await;
    pipeline.stop().await;
    reader_task.await.unwrap();
}
