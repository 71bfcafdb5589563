//! The connector: initial host-endpoint state reading the service name.
//!
//! A guest opens a pipe by writing `pipe:<service>[:<args>]` followed by a
//! NUL byte. The connector accumulates those bytes into a bounded buffer and
//! reports when a complete request has been seen, leaving any bytes written
//! after the NUL for atomic delivery to the freshly bound service pipe.

use crate::transfer;

/// Capacity of the name buffer, including the terminating NUL. A request
/// that fills the buffer without a NUL force-closes the pipe.
pub const MAX_SERVICE_NAME_BUFFER: usize = 128;

const PREFIX: &str = "pipe:";

/// A parsed connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The registered service name. Case-sensitive, never trimmed.
    pub name: String,
    /// Bytes after the second colon, passed opaquely to the factory.
    pub args: Option<String>,
}

/// Outcome of feeding guest bytes to the connector.
#[derive(Debug)]
pub enum ConnectorProgress {
    /// All bytes buffered, no NUL seen yet.
    Pending { consumed: usize },
    /// A complete request was read. `consumed` covers the name bytes and the
    /// NUL; `trailing` holds the rest of the vector, to be handed to the
    /// bound service pipe atomically with the transition.
    Connect {
        request: ConnectRequest,
        consumed: usize,
        trailing: Vec<u8>,
    },
    /// The buffer filled up without a NUL, or the request was malformed.
    Rejected,
}

/// Accumulates the service-name bytes of a nascent pipe.
#[derive(Debug, Default)]
pub struct Connector {
    buf: Vec<u8>,
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one guest buffer vector through the connector.
    pub fn feed(&mut self, bufs: &[&[u8]]) -> ConnectorProgress {
        let incoming = transfer::gather(bufs);
        match incoming.iter().position(|&b| b == 0) {
            None => {
                if self.buf.len() + incoming.len() >= MAX_SERVICE_NAME_BUFFER {
                    return ConnectorProgress::Rejected;
                }
                self.buf.extend_from_slice(&incoming);
                ConnectorProgress::Pending {
                    consumed: incoming.len(),
                }
            }
            Some(pos) => {
                if self.buf.len() + pos + 1 > MAX_SERVICE_NAME_BUFFER {
                    return ConnectorProgress::Rejected;
                }
                self.buf.extend_from_slice(&incoming[..pos]);
                let request = match parse(&self.buf) {
                    Some(request) => request,
                    None => return ConnectorProgress::Rejected,
                };
                self.buf.clear();
                ConnectorProgress::Connect {
                    request,
                    consumed: pos + 1,
                    trailing: incoming[pos + 1..].to_vec(),
                }
            }
        }
    }
}

fn parse(bytes: &[u8]) -> Option<ConnectRequest> {
    let text = std::str::from_utf8(bytes).ok()?;
    let rest = text.strip_prefix(PREFIX)?;
    let (name, args) = match rest.split_once(':') {
        Some((name, args)) => (name, Some(args.to_string())),
        None => (rest, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(ConnectRequest {
        name: name.to_string(),
        args,
    })
}
