use std::process::ExitCode;

use clap::Parser;
use shm_monitor::{
    args::{convert_filter, Args},
    capture::CaptureInvoker,
    server::PublicationServer,
    shutdown,
    store::ArtifactStore,
    Error, Result,
};
use tracing::{error, info, warn};

fn run(args: Args) -> Result<()> {
    let (mut trigger, shutdown) = shutdown::channel();
    ctrlc::set_handler(move || {
        warn!("Interrupted");
        trigger.trigger();
    })
    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    let capture = CaptureInvoker::new(
        &args.program,
        args.capture_args(),
        args.capture_timeout(),
    );
    let store = ArtifactStore::new(&args.capture_dir);
    let server = PublicationServer::bind(("0.0.0.0", args.port), store, capture, shutdown)?
        .with_interval(args.interval());
    server.serve()
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();
    info!("Starting ISUM monitor");
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
