//! This module contains all the capture logic

// Each round we shell out to the vendor capture program, which talks to the FPGA and
// writes one new artifact into the capture directory. We don't get anything back
// besides its output streams and exit status, so all we can do is log those and let
// the store figure out what actually landed on disk.

use std::{
    io::{ErrorKind, Read},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

use tracing::{debug, info, warn};

use crate::{shutdown::Shutdown, Error, Result};

// How often we check on the child while it runs
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CaptureOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// Anything that can produce a fresh artifact in the capture directory
pub trait CaptureSource {
    fn capture(&mut self, shutdown: &Shutdown) -> Result<CaptureOutput>;
}

#[derive(Debug, Clone)]
pub struct CaptureInvoker {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CaptureInvoker {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Run the program once, killing it if it outlives the timeout or shutdown is requested.
    /// The timeout also covers waiting for its output pipes to close, so a background
    /// process left holding them can't stall the round. A non-zero exit is reported as
    /// [`Error::CaptureFailure`].
    pub fn run(&self, shutdown: &Shutdown) -> Result<CaptureOutput> {
        debug!(program = %self.program.display(), args = ?self.args, "Starting capture");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Drain both pipes on their own threads so a chatty child can't block on a full pipe
        let (tx, rx) = unbounded();
        let mut output = Collected::default();
        if let Some(pipe) = child.stdout.take() {
            drain(Pipe::Stdout, pipe, tx.clone());
            output.open += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            drain(Pipe::Stderr, pipe, tx);
            output.open += 1;
        }

        let deadline = Instant::now() + self.timeout;
        let mut status = None;
        let status = loop {
            if status.is_none() {
                status = child.try_wait()?;
            }
            if let Some(status) = status {
                if output.open == 0 {
                    break status;
                }
            }
            if Instant::now() >= deadline {
                if status.is_none() {
                    kill(&mut child);
                }
                return Err(Error::CaptureTimeout {
                    timeout: self.timeout,
                    stderr: output.stderr(),
                });
            }
            if shutdown.requested() {
                if status.is_none() {
                    kill(&mut child);
                }
                let stderr = output.stderr();
                if !stderr.is_empty() {
                    warn!(%stderr, "Capture interrupted");
                }
                return Err(Error::Shutdown);
            }
            let wait = POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            match rx.recv_timeout(wait) {
                Ok(chunk) => output.push(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                // Every drain thread is gone, nothing more will arrive
                Err(RecvTimeoutError::Disconnected) => {
                    output.open = 0;
                    thread::sleep(wait);
                }
            }
        };

        let output = CaptureOutput {
            stdout: output.stdout(),
            stderr: output.stderr(),
            status,
        };
        if output.status.success() {
            info!("Capture finished");
            debug!(stdout = %output.stdout, stderr = %output.stderr, "Capture output");
            Ok(output)
        } else {
            Err(Error::CaptureFailure {
                status: output.status,
                stderr: output.stderr,
            })
        }
    }
}

impl CaptureSource for CaptureInvoker {
    fn capture(&mut self, shutdown: &Shutdown) -> Result<CaptureOutput> {
        self.run(shutdown)
    }
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Pipe, Vec<u8>),
    Closed,
}

#[derive(Default)]
struct Collected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open: usize,
}

impl Collected {
    fn push(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Data(Pipe::Stdout, bytes) => self.stdout.extend(bytes),
            Chunk::Data(Pipe::Stderr, bytes) => self.stderr.extend(bytes),
            Chunk::Closed => self.open = self.open.saturating_sub(1),
        }
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

// The thread outlives `run` if something else keeps the pipe open, and exits on its
// next read once the receiver is gone
fn drain<R: Read + Send + 'static>(pipe: Pipe, mut reader: R, tx: Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Chunk::Data(pipe, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                // A read error just truncates what we log
                Err(_) => break,
            }
        }
        let _ = tx.send(Chunk::Closed);
    });
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill capture program: {e}");
    }
    // Reap it so we don't leave a zombie behind
    let _ = child.wait();
}
