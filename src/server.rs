//! The capture -> analyze -> publish loop.
//!
//! The server accepts exactly one consumer and then runs rounds back to back, pausing a
//! fixed interval between them. Per-round failures (capture errors, missing or malformed
//! artifacts) are logged and the loop carries on. Losing the consumer is fatal, there is
//! no reconnect. The capture directory is wiped on the way out no matter how we leave.

use std::{
    io::{ErrorKind, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    analysis::{AnalysisEngine, RoundAnalysis},
    capture::CaptureSource,
    continuity::ContinuityChecker,
    protocol::round_messages,
    shutdown::Shutdown,
    store::ArtifactStore,
    Error, Result, MAX_KEPT,
};

// How often we look for shutdown while waiting for a consumer
const ACCEPT_POLL: Duration = Duration::from_millis(100);
// How long a single write may block before we look for shutdown again
const WRITE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listening,
    Connected,
    Capturing,
    Analyzing,
    Publishing,
    ShuttingDown,
}

pub struct PublicationServer<C> {
    listener: TcpListener,
    store: ArtifactStore,
    capture: C,
    engine: AnalysisEngine,
    continuity: ContinuityChecker,
    shutdown: Shutdown,
    interval: Duration,
    state: State,
    round: u64,
}

impl<C: CaptureSource> PublicationServer<C> {
    pub fn bind<A: ToSocketAddrs + std::fmt::Debug>(
        addr: A,
        store: ArtifactStore,
        capture: C,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
            addr: format!("{addr:?}"),
            source,
        })?;
        Ok(Self {
            listener,
            store,
            capture,
            engine: AnalysisEngine::default(),
            continuity: ContinuityChecker::new(),
            shutdown,
            interval: DEFAULT_INTERVAL,
            state: State::Listening,
            round: 0,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn enter(&mut self, state: State) {
        debug!(from = ?self.state, to = ?state, "State change");
        self.state = state;
    }

    /// Run until shutdown (returns `Ok`) or until the consumer goes away (returns the error)
    pub fn serve(mut self) -> Result<()> {
        self.store.reset()?;
        let _cleanup = self.store.guard();
        let res = self.serve_connected();
        self.enter(State::ShuttingDown);
        match res {
            Err(Error::Shutdown) => {
                info!("Shutdown requested, cleaning up and exiting");
                Ok(())
            }
            other => other,
        }
    }

    fn serve_connected(&mut self) -> Result<()> {
        let (mut conn, peer) = self.accept()?;
        info!(%peer, "Consumer connected");
        self.enter(State::Connected);
        loop {
            self.shutdown.checkpoint()?;
            match self.run_round() {
                Ok(analysis) => {
                    self.shutdown.checkpoint()?;
                    self.publish(&mut conn, &analysis)?;
                }
                Err(Error::Shutdown) => return Err(Error::Shutdown),
                Err(e) => error!(round = self.round, "Round aborted: {e}"),
            }
            if self.shutdown.wait(self.interval) {
                return Err(Error::Shutdown);
            }
        }
    }

    fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        info!(addr = %self.local_addr()?, "Waiting for a consumer");
        self.listener.set_nonblocking(true)?;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_write_timeout(Some(WRITE_POLL))?;
                    return Ok((stream, peer));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.shutdown.wait(ACCEPT_POLL) {
                        return Err(Error::Shutdown);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Capture, rotate, load and analyze one round. An aborted round leaves the
    /// server back in `Connected`.
    pub fn run_round(&mut self) -> Result<RoundAnalysis> {
        let res = self.analyze_round();
        if res.is_err() {
            self.enter(State::Connected);
        }
        res
    }

    fn analyze_round(&mut self) -> Result<RoundAnalysis> {
        self.round += 1;
        self.enter(State::Capturing);
        match self.capture.capture(&self.shutdown) {
            Ok(_) => info!(round = self.round, "Capture done"),
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            // Whatever is already on disk may still be usable
            Err(e) => warn!(round = self.round, "Capture failed: {e}"),
        }
        let evicted = self.store.enforce_retention(MAX_KEPT)?;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted old artifacts");
        }
        let pair = self.store.load_latest_pair()?;
        info!(
            new_shape = ?pair.new.shape(),
            old_shape = ?pair.old.shape(),
            new_created = %pair.new_file.created_utc(),
            old_created = %pair.old_file.created_utc(),
            "Artifacts decoded"
        );

        self.enter(State::Analyzing);
        let analysis = self.engine.analyze(&pair.new, &pair.old);
        log_analysis(&analysis);
        for mismatch in self.continuity.check(&analysis.stats) {
            warn!(round = self.round, "Continuity mismatch in {mismatch}");
        }
        Ok(analysis)
    }

    fn publish(&mut self, conn: &mut TcpStream, analysis: &RoundAnalysis) -> Result<()> {
        self.enter(State::Publishing);
        let (report, anomalies) = round_messages(analysis)?;
        write_cancellable(conn, report.as_bytes(), &self.shutdown)?;
        if let Some(anomalies) = anomalies {
            write_cancellable(conn, anomalies.as_bytes(), &self.shutdown)?;
        }
        conn.flush().map_err(Error::PublicationFailure)?;
        info!(round = self.round, "Published round");
        self.enter(State::Connected);
        Ok(())
    }
}

/// Write all of `buf`, giving up with [`Error::Shutdown`] if shutdown is requested while
/// the consumer isn't draining. `out` should have a write timeout set so stalls surface.
fn write_cancellable<W: Write>(out: &mut W, mut buf: &[u8], shutdown: &Shutdown) -> Result<()> {
    while !buf.is_empty() {
        match out.write(buf) {
            Ok(0) => {
                return Err(Error::PublicationFailure(ErrorKind::WriteZero.into()));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                shutdown.checkpoint()?;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::PublicationFailure(e)),
        }
    }
    Ok(())
}

fn log_analysis(analysis: &RoundAnalysis) {
    for (file, stats) in [("New File", &analysis.stats.new), ("Old File", &analysis.stats.old)] {
        for (channel, s) in stats.iter() {
            info!(
                "{file} {channel}: mean={} median={} std_dev={} variance={}",
                s.mean, s.median, s.std_dev, s.variance
            );
        }
    }
    for (channel, changes) in analysis.differences.iter() {
        for (metric, (old, new)) in changes {
            info!("Difference in {channel} {metric}: old={old} new={new}");
        }
    }
    for (channel, pair) in analysis.spectrum.iter() {
        info!(
            %channel,
            bins = pair.new.amplitudes.len(),
            new_peak = ?pair.new.peak(),
            old_peak = ?pair.old.peak(),
            "Spectrum"
        );
        trace!(%channel, new = ?pair.new, old = ?pair.old, "Full spectrum");
    }
    for (channel, changes) in analysis.anomalies.iter() {
        for (metric, (old, new)) in changes {
            warn!("Anomaly in {channel} {metric}: old={old} new={new} (out of range)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::CaptureOutput, shutdown};

    // Fails every time without touching the directory
    struct Broken;

    impl CaptureSource for Broken {
        fn capture(&mut self, _shutdown: &Shutdown) -> Result<CaptureOutput> {
            Err(Error::Protocol("no instrument".to_owned()))
        }
    }

    #[test]
    fn test_round_without_artifacts_is_recoverable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (_trigger, shutdown) = shutdown::channel();
        let mut server = PublicationServer::bind("127.0.0.1:0", store, Broken, shutdown).unwrap();
        assert!(matches!(
            server.run_round(),
            Err(Error::InsufficientArtifacts { found: 0 })
        ));
        assert_eq!(server.state(), State::Connected);
    }

    #[test]
    fn test_stalled_consumer_write_honours_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // Connected but never read from
        let _consumer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        conn.set_write_timeout(Some(Duration::from_millis(50))).unwrap();

        let (mut trigger, shutdown) = shutdown::channel();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            trigger.trigger();
        });
        // Far more than the socket buffers on both ends can hold
        let payload = vec![b'x'; 64 * 1024 * 1024];
        let start = std::time::Instant::now();
        let res = write_cancellable(&mut conn, &payload, &shutdown);
        stopper.join().unwrap();
        assert!(matches!(res, Err(Error::Shutdown)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_write_reaches_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut consumer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        let (_trigger, shutdown) = shutdown::channel();
        write_cancellable(&mut conn, b"Stats: {}\n", &shutdown).unwrap();
        drop(conn);
        let mut received = String::new();
        std::io::Read::read_to_string(&mut consumer, &mut received).unwrap();
        assert_eq!(received, "Stats: {}\n");
    }

    #[test]
    fn test_shutdown_while_waiting_for_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("captures");
        let store = ArtifactStore::new(&dir);
        let (mut trigger, shutdown) = shutdown::channel();
        let server = PublicationServer::bind("127.0.0.1:0", store, Broken, shutdown).unwrap();
        trigger.trigger();
        assert!(server.serve().is_ok());
        // Cleaned, not removed
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let (_trigger, shutdown) = shutdown::channel();
        let first = PublicationServer::bind(
            "127.0.0.1:0",
            ArtifactStore::new(tmp.path()),
            Broken,
            shutdown.clone(),
        )
        .unwrap();
        let addr = first.local_addr().unwrap();
        let second = PublicationServer::bind(addr, ArtifactStore::new(tmp.path()), Broken, shutdown);
        assert!(matches!(second, Err(Error::Bind { .. })));
    }
}
