//! Per-connection protocol handling.
//!
//! Each client session is one `SOCK_SEQPACKET` connection; each packet is
//! one request datagram.  Framing errors (bad magic, bad CRC, truncated
//! records) close the session without a reply; semantic request errors are
//! answered with an `ERROR` record.

use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recv, sendmsg, ControlMessage, MsgFlags};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, warn};

use cgreap_core::protocol::{parse_datagram, DatagramBuilder, ResponseCommand};

use crate::namespace::{NamespaceMap, PreparedHandles};
use crate::request::SpawnRequest;

/// Upper bound for one request datagram; the protocol's record size field
/// is 16 bits, so this is generous.
const RECEIVE_BUFFER_SIZE: usize = 128 * 1024;

fn send_datagram(socket: BorrowedFd<'_>, datagram: &[u8], fds: &[RawFd]) -> nix::Result<()> {
    let iov = [IoSlice::new(datagram)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let cmsgs = if fds.is_empty() { &[][..] } else { &cmsgs[..] };

    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    Ok(())
}

fn send_error(socket: BorrowedFd<'_>, message: &str) {
    let mut builder = DatagramBuilder::new();
    builder.push(ResponseCommand::Error, message.as_bytes());

    if let Err(err) = send_datagram(socket, &builder.finish(), &[]) {
        debug!("Failed to send error response: {}", err);
    }
}

fn send_handles(socket: BorrowedFd<'_>, prepared: &PreparedHandles) {
    let mut builder = DatagramBuilder::new();

    if !prepared.nstypes.is_empty() {
        let mut payload = Vec::with_capacity(prepared.nstypes.len() * 4);
        for nstype in &prepared.nstypes {
            payload.extend_from_slice(&nstype.to_ne_bytes());
        }
        builder.push(ResponseCommand::NamespaceHandles, &payload);
    }

    if prepared.lease.is_some() {
        builder.push(ResponseCommand::LeasePipe, &[]);
    }

    // ancillary order matches the payload: namespace handles first, then
    // the lease pipe's write end
    let mut fds: Vec<RawFd> = prepared.fds.iter().map(|fd| fd.as_raw_fd()).collect();
    if let Some(lease) = &prepared.lease {
        fds.push(lease.as_raw_fd());
    }

    if let Err(err) = send_datagram(socket, &builder.finish(), &fds) {
        debug!("Failed to send response: {}", err);
    }

    // after a successful send the kernel has duplicated the descriptors
    // into the peer; our copies go out of scope with `prepared`
}

/// Handles one request datagram.  Returns `false` when the session must be
/// closed (framing failure).
pub fn handle_datagram(socket: BorrowedFd<'_>, datagram: &[u8], namespaces: &NamespaceMap) -> bool {
    let records = match parse_datagram(datagram) {
        Ok(records) => records,
        Err(err) => {
            warn!("Closing connection: {}", err);
            return false;
        }
    };

    let mut request = SpawnRequest::default();
    for record in records {
        let (command, payload) = match record {
            Ok(record) => record,
            Err(err) => {
                warn!("Closing connection: {}", err);
                return false;
            }
        };

        if let Err(err) = request.apply(command, payload) {
            debug!("Bad request: {}", err);
            send_error(socket, &err.to_string());
            return true;
        }
    }

    if !request.wants_response() {
        // NOP-only datagrams get no reply
        return true;
    }

    match namespaces.process(&request) {
        Ok(prepared) => send_handles(socket, &prepared),
        Err(message) => {
            warn!("Request failed: {}", message);
            send_error(socket, &message);
        }
    }

    true
}

/// Drives one client session until it closes or misbehaves.
pub async fn run_connection(socket: OwnedFd, namespaces: NamespaceMap) {
    let socket = match AsyncFd::with_interest(socket, Interest::READABLE) {
        Ok(socket) => socket,
        Err(err) => {
            warn!("Failed to register connection: {}", err);
            return;
        }
    };

    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        let mut guard = match socket.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        match recv(
            socket.get_ref().as_raw_fd(),
            &mut buffer,
            MsgFlags::MSG_DONTWAIT,
        ) {
            // peer closed the connection
            Ok(0) => return,

            Ok(nbytes) => {
                if !handle_datagram(socket.get_ref().as_fd(), &buffer[..nbytes], &namespaces) {
                    return;
                }
            }

            Err(Errno::EAGAIN) => {
                guard.clear_ready();
            }

            Err(err) => {
                debug!("recv failed: {}", err);
                return;
            }
        }
    }
}
