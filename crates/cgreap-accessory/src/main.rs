//! cgreap-accessory - spawn accessory daemon.
//!
//! Answers a small framed request/response protocol on a local seqpacket
//! socket.  Clients name a namespace record and receive cached IPC/PID/
//! user namespace handles as passed file descriptors, so new processes can
//! be attached to an already-prepared namespace without re-doing the
//! setup cost.

mod connection;
mod namespace;
mod request;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::Context;
use clap::Parser;
use nix::sys::socket::{
    accept4, bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, UnixAddr,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

use cgreap_core::sd;

use namespace::NamespaceMap;

/// The default abstract socket name ("@" denotes the abstract namespace).
const DEFAULT_SOCKET: &str = "@cm4all-spawn";

/// Spawn accessory daemon.
#[derive(Parser)]
#[command(name = "cgreap-accessory", about = "Spawn accessory daemon", version)]
struct Args {
    /// Local socket to bind; a leading '@' selects the abstract
    /// namespace.  Ignored when socket-activated.
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("cgreap_accessory={}", level).parse().unwrap())
        .add_directive(format!("cgreap_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn bind_local_socket(name: &str) -> anyhow::Result<OwnedFd> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("Failed to create socket")?;

    setsockopt(&sock, sockopt::PassCred, &true).context("Failed to set SO_PASSCRED")?;

    let addr = if let Some(abstract_name) = name.strip_prefix('@') {
        UnixAddr::new_abstract(abstract_name.as_bytes())
    } else {
        UnixAddr::new(name)
    }
    .context("Bad socket address")?;

    bind(sock.as_raw_fd(), &addr).context("Failed to bind")?;
    listen(&sock, Backlog::new(64)?).context("Failed to listen")?;

    Ok(sock)
}

/// Accepts connections on one listener socket forever.
async fn run_listener(listener: OwnedFd, namespaces: NamespaceMap) {
    let listener = match AsyncFd::with_interest(listener, Interest::READABLE) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("Failed to register listener: {}", err);
            return;
        }
    };

    loop {
        let mut guard = match listener.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        match accept4(
            listener.get_ref().as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => {
                debug!("New connection");
                // SAFETY: accept4 just returned this descriptor to us.
                let socket = unsafe { OwnedFd::from_raw_fd(fd) };
                let _ = tokio::task::spawn_local(connection::run_connection(
                    socket,
                    namespaces.clone(),
                ));
            }
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
            }
            Err(err) => {
                warn!("accept failed: {}", err);
                guard.clear_ready();
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let namespaces = NamespaceMap::new();

    let mut listeners = sd::listen_fds();
    if listeners.is_empty() {
        listeners.push(bind_local_socket(&args.socket)?);
        info!("Listening on {}", args.socket);
    } else {
        info!("Adopted {} supervisor socket(s)", listeners.len());
    }

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        accept_tasks.push(tokio::task::spawn_local(run_listener(
            listener,
            namespaces.clone(),
        )));
    }

    sd::notify_ready();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => debug!("Ignoring SIGHUP"),
        }
    }

    // close the listeners first, then discard every pooled namespace;
    // in-flight connection tasks die with the runtime
    for task in accept_tasks {
        task.abort();
    }
    namespaces.clear();

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("cgreap-accessory {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(run(args)))?;

    info!("Shutdown complete");
    Ok(())
}
