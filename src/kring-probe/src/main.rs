use std::{
    error::Error,
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    process::ExitCode,
    time::{Duration, Instant},
};

use kring::{Builder, SubmissionEntry};
use kring_core::sys::unix as sys;
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const USAGE: &str = "usage: kring-probe [ADDR] [--timeout-ms N]";
const DEFAULT_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

const CONNECT: Token = Token(0);
const PROBE_TAG: u64 = 0x6b72_696e_67;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    addr: SocketAddr,
    timeout: Duration,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut addr = None;
        let mut timeout = DEFAULT_TIMEOUT;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--timeout-ms" => {
                    let value = args.next().ok_or("--timeout-ms needs a value")?;
                    let ms = value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid timeout: {value}"))?;
                    timeout = Duration::from_millis(ms);
                }
                _ if addr.is_none() && !arg.starts_with('-') => {
                    let parsed = arg
                        .parse::<SocketAddr>()
                        .map_err(|_| format!("invalid address: {arg}"))?;
                    addr = Some(parsed);
                }
                _ => return Err(format!("unexpected argument: {arg}")),
            }
        }

        let addr = match addr {
            Some(addr) => addr,
            None => DEFAULT_ADDR
                .parse::<SocketAddr>()
                .map_err(|_| format!("invalid address: {DEFAULT_ADDR}"))?,
        };

        Ok(Self { addr, timeout })
    }
}

/// Connects a raw non-blocking TCP socket to `addr`, waiting at most `timeout` for the
/// handshake.
fn probe_connect(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    let fd = sys::socket(sys::domain(&addr), libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0)?;

    match sys::connect(&fd, &addr) {
        Ok(()) => return Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(err),
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(4);
    let raw_fd = fd.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&raw_fd), CONNECT, Interest::WRITABLE)?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }

        if events.iter().any(|event| event.token() == CONNECT) {
            break;
        }
        if remaining.is_zero() {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
    }

    if let Some(err) = sys::take_error(&fd)? {
        return Err(err);
    }

    let peer = sys::peer_addr(&fd)?;
    tracing::debug!(%peer, "tcp handshake complete");

    Ok(())
}

/// Creates a small ring and round-trips a NOP through it.
fn probe_ring() -> Result<(), Box<dyn Error>> {
    let mut ring = Builder::new(8).build()?;
    ring.submit(SubmissionEntry::nop().user_data(PROBE_TAG))?;
    ring.submit_and_wait(1)?;

    let cqe = ring.reap().next().ok_or("no completion posted")?;
    if cqe.user_data() != PROBE_TAG {
        return Err(format!("completion tag {:#x} does not match", cqe.user_data()).into());
    }
    cqe.io_result()?;

    tracing::info!(
        sq_entries = ring.params().sq_entries(),
        cq_entries = ring.params().cq_entries(),
        features = ?ring.params().features(),
        "io_uring available"
    );
    ring.close()?;

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_writer(io::stderr))
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(addr = %args.addr, timeout = ?args.timeout, "probing");

    let connected = match probe_connect(args.addr, args.timeout) {
        Ok(()) => {
            println!("connected!");
            true
        }
        Err(err) => {
            println!("could not connect: {err}");
            false
        }
    };

    if let Err(err) = probe_ring() {
        tracing::warn!(%err, "io_uring unavailable");
    }

    if connected {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
