use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamload::transport::memory;
use streamload::{Client, Config, ProgressCallback, ProgressEvent, Server, StreamSpec};

/// Callback that keeps every event it sees
struct Recording {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl ProgressCallback for Recording {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn configs() -> (Config, Config) {
    let client = Config::new("memory")
        .with_packet_size(1000)
        .with_sessions(2)
        .with_time_slot(Duration::from_millis(20))
        .with_drain_poll(Duration::from_millis(5))
        .with_stream(StreamSpec::fixed(0.03, 8.0))
        .with_stream(StreamSpec::poisson(0.02, 8.0));
    let server = Config::new("memory")
        .with_packet_size(1000)
        .with_sessions(2)
        .with_stream(StreamSpec::receive_only(0.03))
        .with_stream(StreamSpec::receive_only(0.02));
    (client, server)
}

#[tokio::test(start_paused = true)]
async fn test_struct_callback_sees_whole_run() {
    let (client_config, server_config) = configs();
    let (connector, acceptor) = memory::pair(memory::DEFAULT_BUFFER);

    let events = Arc::new(Mutex::new(Vec::new()));
    let client = Client::with_connector(client_config, Arc::new(connector))
        .unwrap()
        .with_quiet(true)
        .with_file_logs(false)
        .with_callback(Recording {
            events: events.clone(),
        });
    let server = Server::new(server_config)
        .unwrap()
        .with_acceptor(Arc::new(acceptor))
        .with_quiet(true)
        .with_file_logs(false);

    let (sent, received) = tokio::join!(client.run(), server.run());
    assert!(sent.unwrap().is_success());
    assert!(received.unwrap().is_success());

    let events = events.lock().unwrap();
    let started = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SessionStarted { .. }))
        .count();
    let completed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StreamCompleted(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started, 2);
    assert_eq!(completed.len(), 4);
    assert!(completed
        .iter()
        .all(|s| s.bytes == if s.stream == 0 { 30_000 } else { 20_000 }));

    // The run summary is always the last event
    match events.last() {
        Some(ProgressEvent::RunCompleted {
            completed,
            failed,
            total_bytes,
        }) => {
            assert_eq!(*completed, 4);
            assert_eq!(*failed, 0);
            assert_eq!(*total_bytes, 100_000);
        }
        other => panic!("unexpected last event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_closure_callback_on_server() {
    let (client_config, server_config) = configs();
    let (connector, acceptor) = memory::pair(memory::DEFAULT_BUFFER);

    let received_bytes = Arc::new(Mutex::new(0u64));
    let counter = received_bytes.clone();
    let server = Server::new(server_config)
        .unwrap()
        .with_acceptor(Arc::new(acceptor))
        .with_quiet(true)
        .with_file_logs(false)
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::StreamCompleted(summary) = event {
                *counter.lock().unwrap() += summary.bytes;
            }
        });
    let client = Client::with_connector(client_config, Arc::new(connector))
        .unwrap()
        .with_quiet(true)
        .with_file_logs(false);

    let (sent, received) = tokio::join!(client.run(), server.run());
    sent.unwrap();
    let report = received.unwrap();
    assert_eq!(*received_bytes.lock().unwrap(), 100_000);
    assert_eq!(report.total_bytes(), 100_000);
}

#[tokio::test(start_paused = true)]
async fn test_failures_reach_the_callback() {
    let (connector, _acceptor) = memory::pair(memory::DEFAULT_BUFFER);
    connector.refuse_next(100);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let (client_config, _) = configs();
    let client = Client::with_connector(client_config, Arc::new(connector))
        .unwrap()
        .with_retry_policy(streamload::RetryPolicy::none())
        .with_quiet(true)
        .with_file_logs(false)
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::SessionFailed { session, .. } = event {
                sink.lock().unwrap().push(session);
            }
        });

    let report = client.run().await.unwrap();
    assert_eq!(report.failed(), 2);
    let mut failed = failures.lock().unwrap().clone();
    failed.sort();
    assert_eq!(failed, vec![0, 1]);
}
