#![cfg(unix)]

use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader},
    net::TcpStream,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::ExitStatus,
    thread,
    time::{Duration, Instant},
};

use shm_monitor::{
    analysis::{Channel, Metric},
    capture::{CaptureOutput, CaptureSource},
    matrix::SampleMatrix,
    protocol::{Message, Telemetry},
    server::PublicationServer,
    shutdown::{self, Shutdown},
    store::ArtifactStore,
    Error, Result,
};

/// Writes one queued artifact per round, then keeps succeeding without writing anything
struct ScriptedCapture {
    dir: PathBuf,
    queue: VecDeque<Vec<u8>>,
    written: usize,
}

impl ScriptedCapture {
    fn new(dir: PathBuf, queue: Vec<SampleMatrix>) -> Self {
        Self::raw(dir, queue.iter().map(|m| m.as_bytes().to_vec()).collect())
    }

    fn raw(dir: PathBuf, queue: Vec<Vec<u8>>) -> Self {
        Self {
            dir,
            queue: queue.into(),
            written: 0,
        }
    }
}

impl CaptureSource for ScriptedCapture {
    fn capture(&mut self, _shutdown: &Shutdown) -> Result<CaptureOutput> {
        if let Some(bytes) = self.queue.pop_front() {
            let path = self.dir.join(format!("capture_{:03}.bin", self.written));
            fs::write(path, bytes)?;
            self.written += 1;
        }
        Ok(CaptureOutput {
            stdout: String::new(),
            stderr: String::new(),
            status: ExitStatus::from_raw(0),
        })
    }
}

fn offset(value: i16) -> SampleMatrix {
    let mut m = SampleMatrix::default();
    m.channel_mut(0).fill(value);
    m
}

#[test]
fn offset_capture_is_published_as_anomaly() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("tests_iot");
    let capture = ScriptedCapture::new(dir.clone(), vec![offset(0), offset(50)]);
    let (mut trigger, shutdown) = shutdown::channel();
    let server = PublicationServer::bind(
        "127.0.0.1:0",
        ArtifactStore::new(&dir),
        capture,
        shutdown,
    )
    .unwrap()
    .with_interval(Duration::from_millis(50));
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());

    let stream = TcpStream::connect(addr).unwrap();
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    for _ in 0..3 {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        lines.push(line);
    }
    trigger.trigger();
    handle.join().unwrap().unwrap();

    // The first round only had one artifact, so this is all from the second
    assert!(lines[0].starts_with("Stats: "));
    assert!(lines[1].starts_with("Differences: "));
    assert!(lines[2].starts_with("Anomalies: "));
    let telemetry = Telemetry::from_lines(&lines.concat());
    let differences = telemetry.differences.as_ref().unwrap();
    assert_eq!(differences.channel_1.get(&Metric::Mean), Some(&(0.0, 50.0)));
    assert!(differences.channel_2.is_empty());
    let anomalies = telemetry.anomalies.as_ref().unwrap();
    assert_eq!(anomalies.get(Channel::One).get(&Metric::Mean), Some(&(0.0, 50.0)));
    assert!(telemetry.anomalies_present());

    // Directory is wiped on the way out
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}

#[test]
fn quiet_rounds_skip_anomaly_line() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("tests_iot");
    let capture = ScriptedCapture::new(dir.clone(), vec![offset(3), offset(3), offset(3)]);
    let (mut trigger, shutdown) = shutdown::channel();
    let server = PublicationServer::bind(
        "127.0.0.1:0",
        ArtifactStore::new(&dir),
        capture,
        shutdown,
    )
    .unwrap()
    .with_interval(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());

    let mut reader = BufReader::new(TcpStream::connect(addr).unwrap());
    let mut kinds = Vec::new();
    for _ in 0..4 {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        kinds.push(Message::decode(&line).unwrap().unwrap());
    }
    trigger.trigger();
    handle.join().unwrap().unwrap();

    assert!(matches!(kinds[0], Message::Stats(_)));
    assert!(matches!(kinds[1], Message::Differences(ref d) if d.is_empty()));
    assert!(matches!(kinds[2], Message::Stats(_)));
    assert!(matches!(kinds[3], Message::Differences(_)));
}

#[test]
fn lost_consumer_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("tests_iot");
    let queue = (0..50).map(|i| offset((i % 7) as i16)).collect();
    let capture = ScriptedCapture::new(dir.clone(), queue);
    let (_trigger, shutdown) = shutdown::channel();
    let server = PublicationServer::bind(
        "127.0.0.1:0",
        ArtifactStore::new(&dir),
        capture,
        shutdown,
    )
    .unwrap()
    .with_interval(Duration::from_millis(5));
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());

    drop(TcpStream::connect(addr).unwrap());
    let res = handle.join().unwrap();
    assert!(matches!(res, Err(Error::PublicationFailure(_))));
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}

#[test]
fn truncated_artifact_only_aborts_its_rounds() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("tests_iot");
    let valid = |v| offset(v).as_bytes().to_vec();
    // The short file poisons the two rounds that load it, then rotates out
    let queue = vec![valid(0), vec![0u8; 1000], valid(1), valid(9)];
    let capture = ScriptedCapture::raw(dir.clone(), queue);
    let (mut trigger, shutdown) = shutdown::channel();
    let server = PublicationServer::bind(
        "127.0.0.1:0",
        ArtifactStore::new(&dir),
        capture,
        shutdown,
    )
    .unwrap()
    .with_interval(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());

    let mut reader = BufReader::new(TcpStream::connect(addr).unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    trigger.trigger();
    handle.join().unwrap().unwrap();

    match Message::decode(&line).unwrap() {
        Some(Message::Stats(stats)) => {
            assert_eq!(stats.old.get(Channel::One).mean, 1.0);
            assert_eq!(stats.new.get(Channel::One).mean, 9.0);
        }
        other => panic!("expected stats from the fourth round, got {other:?}"),
    }
}

#[test]
fn stalled_consumer_does_not_block_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("tests_iot");
    let queue = (0..40).map(|i| offset(i as i16)).collect();
    let capture = ScriptedCapture::new(dir.clone(), queue);
    let (mut trigger, shutdown) = shutdown::channel();
    let server = PublicationServer::bind(
        "127.0.0.1:0",
        ArtifactStore::new(&dir),
        capture,
        shutdown,
    )
    .unwrap()
    .with_interval(Duration::ZERO);
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());

    // Connected, never read
    let _consumer = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_secs(2));
    trigger.trigger();
    let stopped = Instant::now();
    handle.join().unwrap().unwrap();
    assert!(stopped.elapsed() < Duration::from_secs(5));
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}
