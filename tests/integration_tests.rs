use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamload::recorder::{read_log, Direction};
use streamload::transport::memory;
use streamload::transport::quic::QuicListener;
use streamload::transport::tcp::TlsListener;
use streamload::{Client, Config, Mode, RunReport, Server, StreamSpec, TransportMode};

fn temp_dir(name: &str) -> PathBuf {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir().join(format!(
        "streamload-it-{}-{}-{}",
        name,
        std::process::id(),
        nanos
    ))
}

/// Runs a client and a server against each other over in-memory pipes.
async fn run_in_memory(config: Config, log_dir: Option<PathBuf>) -> (RunReport, RunReport) {
    let (connector, acceptor) = memory::pair(memory::DEFAULT_BUFFER);
    let config = match &log_dir {
        Some(dir) => config.with_log_dir(dir),
        None => config,
    };
    let file_logs = log_dir.is_some();

    let server = Server::new(config.clone())
        .unwrap()
        .with_acceptor(Arc::new(acceptor))
        .with_quiet(true)
        .with_file_logs(file_logs);
    let client = Client::with_connector(config, Arc::new(connector))
        .unwrap()
        .with_quiet(true)
        .with_file_logs(file_logs);

    let (client_report, server_report) = tokio::join!(client.run(), server.run());
    (client_report.unwrap(), server_report.unwrap())
}

#[test]
fn test_config_builder() {
    let config = Config::new("192.168.1.100:4242")
        .with_packet_size(1200)
        .with_sessions(3)
        .with_time_slot(Duration::from_millis(50))
        .with_stream(StreamSpec::fixed(1.0, 8.0))
        .with_stream(StreamSpec::poisson(2.0, 4.0))
        .with_io_timeout(Duration::from_secs(2))
        .with_seed(42);

    assert_eq!(config.pkt_size, 1200);
    assert_eq!(config.total_session, 3);
    assert_eq!(config.total_stream, 2);
    assert_eq!(config.slot_duration().unwrap(), Duration::from_millis(50));
    assert_eq!(config.io_timeout(), Some(Duration::from_secs(2)));
    assert_eq!(config.transport(), TransportMode::Quic);
    assert_eq!(config.target_bytes(1), Some(2_000_000));
    config.validate(Mode::Client).unwrap();

    let tcp = config.with_tcp(true);
    assert_eq!(tcp.sessions(), 1);
    assert_eq!(tcp.streams_per_session(), 1);
}

#[test]
fn test_config_file_round_trip() {
    let dir = temp_dir("config");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("client.json");

    let config = Config::new("127.0.0.1:4242")
        .with_time_slot(Duration::from_millis(100))
        .with_stream(StreamSpec::uniform(0.5, 2.0, 6.0));
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"TimeSlot\": 100"));
    assert!(text.contains("\"Type\": \"uniform\""));

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.info_stream, config.info_stream);
    loaded.validate(Mode::Client).unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(start_paused = true)]
async fn test_loopback_one_megabyte_at_eight_mbps() {
    let config = Config::new("memory")
        .with_packet_size(1000)
        .with_time_slot(Duration::from_millis(100))
        .with_drain_poll(Duration::from_millis(1))
        .with_stream(StreamSpec::fixed(1.0, 8.0));

    let (client, server) = run_in_memory(config, None).await;
    assert!(client.is_success());
    assert!(server.is_success());

    let sent = client.summary(0, 0).unwrap();
    assert_eq!(sent.direction, Direction::Sent);
    assert_eq!(sent.bytes, 1_000_000);
    // 100 packets per slot, ten slots
    assert_eq!(sent.slots, 10);
    assert_eq!(sent.chunks, 1000);
    assert!(
        (sent.elapsed.as_secs_f64() - 1.0).abs() < 0.01,
        "sender elapsed {:?}",
        sent.elapsed
    );
    assert!((sent.mbps - 8.0).abs() < 0.1, "sender rate {}", sent.mbps);

    let received = server.summary(0, 0).unwrap();
    assert_eq!(received.direction, Direction::Received);
    assert_eq!(received.bytes, 1_000_000);
    // Measured from the first arrival (end of slot one) to the last
    assert!(
        (8.0..9.5).contains(&received.mbps),
        "receiver rate {}",
        received.mbps
    );
}

#[tokio::test(start_paused = true)]
async fn test_byte_conservation_across_sessions() {
    let dir = temp_dir("conservation");
    let config = Config::new("memory")
        .with_packet_size(1000)
        .with_sessions(2)
        .with_time_slot(Duration::from_millis(100))
        .with_drain_poll(Duration::from_millis(5))
        .with_seed(17)
        .with_stream(StreamSpec::fixed(0.25, 8.0))
        .with_stream(StreamSpec::poisson(0.1234, 4.0))
        .with_stream(StreamSpec::log_normal(0.2, 8.0, 0.4));

    let (client, server) = run_in_memory(config.clone(), Some(dir.clone())).await;
    assert_eq!(client.completed(), 6);
    assert_eq!(server.completed(), 6);

    for s in 0..2 {
        for k in 0..3 {
            let target = config.target_bytes(k).unwrap();
            assert_eq!(client.summary(s, k).unwrap().bytes, target);
            assert_eq!(server.summary(s, k).unwrap().bytes, target);

            let sent = read_log(dir.join(format!("logClient_{}_{}.log", s + 1, k + 1))).unwrap();
            let got = read_log(dir.join(format!("logServer_{}_{}.log", s + 1, k + 1))).unwrap();
            assert_eq!(sent.iter().map(|r| r.bytes).sum::<u64>(), target);
            assert_eq!(got.iter().map(|r| r.bytes).sum::<u64>(), target);
            assert!(sent.iter().all(|r| r.bytes > 0 && r.bytes <= 1000));
            assert!(sent.windows(2).all(|w| w[0].timestamp_us <= w[1].timestamp_us));
        }
    }
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(start_paused = true)]
async fn test_four_streams_with_different_processes() {
    let config = Config::new("memory")
        .with_packet_size(500)
        .with_time_slot(Duration::from_millis(50))
        .with_drain_poll(Duration::from_millis(5))
        .with_seed(3)
        .with_stream(StreamSpec::fixed(0.1, 2.0))
        .with_stream(StreamSpec::poisson(0.1, 4.0))
        .with_stream(StreamSpec::log_normal(0.1, 4.0, 0.5))
        .with_stream(StreamSpec::uniform(0.1, 2.0, 6.0));

    let (client, server) = run_in_memory(config, None).await;
    assert!(client.is_success());
    assert!(server.is_success());
    for k in 0..4 {
        assert_eq!(client.summary(0, k).unwrap().bytes, 100_000);
        assert_eq!(server.summary(0, k).unwrap().bytes, 100_000);
    }
    // 2 Mbps over 50 ms is 25 packets of 500 B per slot
    assert_eq!(client.summary(0, 0).unwrap().slots, 8);
}

#[tokio::test(start_paused = true)]
async fn test_tcp_mode_carries_only_stream_zero() {
    let dir = temp_dir("tcp-mode");
    let config = Config::new("memory")
        .with_tcp(true)
        .with_packet_size(1000)
        .with_sessions(4)
        .with_time_slot(Duration::from_millis(100))
        .with_stream(StreamSpec::fixed(0.3, 8.0))
        .with_stream(StreamSpec::fixed(5.0, 8.0));

    let (client, server) = run_in_memory(config, Some(dir.clone())).await;
    assert_eq!(client.streams.len(), 1);
    assert_eq!(server.streams.len(), 1);
    assert_eq!(client.summary(0, 0).unwrap().bytes, 300_000);
    assert_eq!(server.summary(0, 0).unwrap().bytes, 300_000);

    let sent = read_log(dir.join("logClientTCP.log")).unwrap();
    let got = read_log(dir.join("logServerTCP.log")).unwrap();
    assert_eq!(sent.len(), 300);
    assert_eq!(got.iter().map(|r| r.bytes).sum::<u64>(), 300_000);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_quic_loopback() {
    let server_config = Config::new("127.0.0.1:0")
        .with_packet_size(1000)
        .with_stream(StreamSpec::receive_only(0.05))
        .with_stream(StreamSpec::receive_only(0.02));
    let listener = QuicListener::bind(&server_config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::new(server_config)
        .unwrap()
        .with_acceptor(Arc::new(listener))
        .with_quiet(true)
        .with_file_logs(false);

    let client_config = Config::new(addr.to_string())
        .with_packet_size(1000)
        .with_time_slot(Duration::from_millis(10))
        .with_drain_poll(Duration::from_millis(5))
        .with_stream(StreamSpec::fixed(0.05, 8.0))
        .with_stream(StreamSpec::fixed(0.02, 8.0));
    let client = Client::new(client_config)
        .unwrap()
        .with_quiet(true)
        .with_file_logs(false);

    let (client_report, server_report) = tokio::join!(client.run(), server.run());
    let client_report = client_report.unwrap();
    let server_report = server_report.unwrap();
    assert!(client_report.is_success(), "{:?}", client_report);
    assert!(server_report.is_success(), "{:?}", server_report);
    assert_eq!(server_report.summary(0, 0).unwrap().bytes, 50_000);
    assert_eq!(server_report.summary(0, 1).unwrap().bytes, 20_000);
}

#[tokio::test]
async fn test_tls_tcp_loopback() {
    let server_config = Config::new("127.0.0.1:0")
        .with_tcp(true)
        .with_packet_size(1000)
        .with_stream(StreamSpec::receive_only(0.04));
    let listener = TlsListener::bind(&server_config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::new(server_config)
        .unwrap()
        .with_acceptor(Arc::new(listener))
        .with_quiet(true)
        .with_file_logs(false);

    let client_config = Config::new(addr.to_string())
        .with_tcp(true)
        .with_packet_size(1000)
        .with_time_slot(Duration::from_millis(10))
        .with_stream(StreamSpec::fixed(0.04, 8.0));
    let client = Client::new(client_config)
        .unwrap()
        .with_quiet(true)
        .with_file_logs(false);

    let (client_report, server_report) = tokio::join!(client.run(), server.run());
    let sent = client_report.unwrap().into_result().unwrap();
    let received = server_report.unwrap().into_result().unwrap();
    assert_eq!(sent[0].bytes, 40_000);
    assert_eq!(received[0].bytes, 40_000);
}
