//! Accumulates the records of one request datagram into a validated
//! request.

use std::fmt;

use cgreap_core::protocol::RequestCommand;

/// A request failed validation; the message goes back to the client in an
/// `ERROR` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    Duplicate(&'static str),
    Malformed(&'static str),
    UnknownCommand(u16),
    NoName,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Duplicate(name) => write!(f, "Duplicate {}", name),
            RequestError::Malformed(name) => write!(f, "Malformed {}", name),
            RequestError::UnknownCommand(raw) => write!(f, "Unknown command {}", raw),
            RequestError::NoName => f.write_str("No NAME"),
        }
    }
}

impl std::error::Error for RequestError {}

/// The decoded request: which namespace record it addresses and which
/// handles it wants.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub name: Option<String>,

    pub ipc_namespace: bool,
    pub pid_namespace: bool,

    /// The raw uid_map + NUL + gid_map payload; cached namespaces are
    /// keyed by these exact bytes.
    pub user_namespace: Option<Vec<u8>>,

    pub lease_pipe: bool,
}

fn check_non_empty_ascii(payload: &[u8]) -> Result<String, RequestError> {
    if payload.is_empty() {
        return Err(RequestError::Malformed("NAME"));
    }

    if payload.iter().any(|&byte| byte < 0x20) {
        return Err(RequestError::Malformed("NAME"));
    }

    String::from_utf8(payload.to_vec()).map_err(|_| RequestError::Malformed("NAME"))
}

impl SpawnRequest {
    /// Applies one record.  Keyed commands may appear at most once per
    /// datagram.
    pub fn apply(&mut self, command: u16, payload: &[u8]) -> Result<(), RequestError> {
        let command =
            RequestCommand::from_u16(command).ok_or(RequestError::UnknownCommand(command))?;

        match command {
            RequestCommand::Nop => {}

            RequestCommand::Name => {
                if self.name.is_some() {
                    return Err(RequestError::Duplicate("NAME"));
                }
                self.name = Some(check_non_empty_ascii(payload)?);
            }

            RequestCommand::IpcNamespace => {
                if self.ipc_namespace {
                    return Err(RequestError::Duplicate("IPC_NAMESPACE"));
                }
                if !payload.is_empty() {
                    return Err(RequestError::Malformed("IPC_NAMESPACE"));
                }
                self.ipc_namespace = true;
            }

            RequestCommand::PidNamespace => {
                if self.pid_namespace {
                    return Err(RequestError::Duplicate("PID_NAMESPACE"));
                }
                if !payload.is_empty() {
                    return Err(RequestError::Malformed("PID_NAMESPACE"));
                }
                self.pid_namespace = true;
            }

            RequestCommand::UserNamespace => {
                if self.user_namespace.is_some() {
                    return Err(RequestError::Duplicate("USER_NAMESPACE"));
                }
                // uid_map and gid_map are separated by exactly one NUL;
                // either side may be empty
                if !payload.contains(&0) {
                    return Err(RequestError::Malformed("USER_NAMESPACE"));
                }
                self.user_namespace = Some(payload.to_vec());
            }

            RequestCommand::LeasePipe => {
                if self.lease_pipe {
                    return Err(RequestError::Duplicate("LEASE_PIPE"));
                }
                if !payload.is_empty() {
                    return Err(RequestError::Malformed("LEASE_PIPE"));
                }
                self.lease_pipe = true;
            }
        }

        Ok(())
    }

    /// True if the request asks for anything that needs a response.
    pub fn wants_response(&self) -> bool {
        self.ipc_namespace
            || self.pid_namespace
            || self.user_namespace.is_some()
            || self.lease_pipe
    }

    /// Returns the validated name, required for any namespace operation.
    pub fn require_name(&self) -> Result<&str, RequestError> {
        self.name.as_deref().ok_or(RequestError::NoName)
    }
}

/// Splits a `USER_NAMESPACE` payload into its uid_map and gid_map halves.
pub fn split_user_payload(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|&byte| byte == 0) {
        Some(nul) => (&payload[..nul], &payload[nul + 1..]),
        None => (payload, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_validated() {
        let mut request = SpawnRequest::default();
        assert_eq!(
            request.apply(RequestCommand::Name as u16, b""),
            Err(RequestError::Malformed("NAME"))
        );
        assert_eq!(
            request.apply(RequestCommand::Name as u16, b"bad\x01name"),
            Err(RequestError::Malformed("NAME"))
        );

        assert_eq!(request.apply(RequestCommand::Name as u16, b"tenant-a"), Ok(()));
        assert_eq!(request.name.as_deref(), Some("tenant-a"));

        assert_eq!(
            request.apply(RequestCommand::Name as u16, b"again"),
            Err(RequestError::Duplicate("NAME"))
        );
    }

    #[test]
    fn flag_records_must_be_empty_and_unique() {
        let mut request = SpawnRequest::default();
        assert_eq!(
            request.apply(RequestCommand::IpcNamespace as u16, b"x"),
            Err(RequestError::Malformed("IPC_NAMESPACE"))
        );
        assert_eq!(request.apply(RequestCommand::IpcNamespace as u16, b""), Ok(()));
        assert_eq!(
            request.apply(RequestCommand::IpcNamespace as u16, b""),
            Err(RequestError::Duplicate("IPC_NAMESPACE"))
        );

        assert_eq!(request.apply(RequestCommand::PidNamespace as u16, b""), Ok(()));
        assert_eq!(request.apply(RequestCommand::LeasePipe as u16, b""), Ok(()));
        assert!(request.wants_response());
    }

    #[test]
    fn user_namespace_payload() {
        let mut request = SpawnRequest::default();
        assert_eq!(
            request.apply(RequestCommand::UserNamespace as u16, b"no separator"),
            Err(RequestError::Malformed("USER_NAMESPACE"))
        );

        let payload = b"0 1000 1\00 1000 1";
        assert_eq!(
            request.apply(RequestCommand::UserNamespace as u16, payload),
            Ok(())
        );
        let stored = request.user_namespace.as_deref().unwrap();
        assert_eq!(
            split_user_payload(stored),
            (b"0 1000 1".as_slice(), b"0 1000 1".as_slice())
        );
    }

    #[test]
    fn user_namespace_sides_may_be_empty() {
        assert_eq!(split_user_payload(b"\0"), (b"".as_slice(), b"".as_slice()));
        assert_eq!(
            split_user_payload(b"0 0 1\0"),
            (b"0 0 1".as_slice(), b"".as_slice())
        );
        assert_eq!(
            split_user_payload(b"\00 0 1"),
            (b"".as_slice(), b"0 0 1".as_slice())
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut request = SpawnRequest::default();
        assert_eq!(
            request.apply(999, b""),
            Err(RequestError::UnknownCommand(999))
        );
    }

    #[test]
    fn nop_and_empty_request() {
        let mut request = SpawnRequest::default();
        assert_eq!(request.apply(RequestCommand::Nop as u16, b""), Ok(()));
        assert!(!request.wants_response());
        assert_eq!(request.require_name(), Err(RequestError::NoName));
    }
}
