//! Client side of the request/reply protocol

use super::framing::{is_frameable, write_message, MessageBuffer};
use super::{socket_path, COMM_DIR};
use crate::error::{Error, Result};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Connection to a named server
///
/// Requests on one connection are answered in order. Dropping the client
/// closes the connection and frees its slot on the server.
#[derive(Debug)]
pub struct RpcClient {
    stream: UnixStream,
    inbox: MessageBuffer,
    dest: String,
}

impl RpcClient {
    /// Connect to the server registered as `dest` under `root`.
    pub fn connect(root: impl AsRef<Path>, dest: &str) -> Result<Self> {
        Self::connect_limited(root, dest, None)
    }

    /// Like [`RpcClient::connect`], refusing replies longer than
    /// `max_reply_len` bytes.
    pub fn connect_limited(
        root: impl AsRef<Path>,
        dest: &str,
        max_reply_len: Option<usize>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let path = socket_path(root, dest)?;

        let comm_dir = root.join(COMM_DIR);
        if !comm_dir.is_dir() {
            return Err(Error::NotFound {
                what: format!("socket directory {}", comm_dir.display()),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        let stream = UnixStream::connect(&path)
            .map_err(|e| Error::from_os(format!("connecting to '{dest}'"), e))?;
        tracing::trace!(server = dest, "connected");

        Ok(Self {
            stream,
            inbox: MessageBuffer::new(max_reply_len),
            dest: dest.to_string(),
        })
    }

    /// Name of the server this client talks to
    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Send one request and wait for its reply.
    pub fn send(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        check_request(message)?;
        write_message(&mut self.stream, message)
            .map_err(|e| Error::unavailable(format!("sending to '{}'", self.dest), e))?;
        self.receive()
    }

    /// Write every request before reading any reply.
    ///
    /// Replies come back in request order. Nothing is sent if any request
    /// contains NUL.
    pub fn send_pipelined(&mut self, messages: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        for message in messages {
            check_request(message)?;
        }
        for message in messages {
            write_message(&mut self.stream, message)
                .map_err(|e| Error::unavailable(format!("sending to '{}'", self.dest), e))?;
        }
        messages.iter().map(|_| self.receive()).collect()
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let what = format!("receiving from '{}'", self.dest);
        match self.inbox.read_message(&mut self.stream) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::unavailable(
                what,
                io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection"),
            )),
            Err(e) => Err(e.into_error(&what)),
        }
    }
}

fn check_request(message: &[u8]) -> Result<()> {
    if is_frameable(message) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(
            "request contains a NUL byte".to_string(),
        ))
    }
}

/// One-shot exchange: connect, send `message`, return the reply, disconnect.
pub fn send_command(root: impl AsRef<Path>, dest: &str, message: &[u8]) -> Result<Vec<u8>> {
    send_command_limited(root, dest, message, None)
}

/// [`send_command`] with a bound on the reply length.
pub fn send_command_limited(
    root: impl AsRef<Path>,
    dest: &str,
    message: &[u8],
    max_reply_len: Option<usize>,
) -> Result<Vec<u8>> {
    check_request(message)?;
    RpcClient::connect_limited(root, dest, max_reply_len)?.send(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handler::handler_fn;
    use crate::rpc::log::LogDestination;
    use crate::rpc::server::{RpcServer, ServerConfig};

    fn echo_server(root: &Path, name: &str) -> RpcServer {
        RpcServer::init(
            root,
            name,
            handler_fn(|request| Ok(request.to_vec()), |_| {}),
            LogDestination::Disabled,
            ServerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_identity_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let server = echo_server(root.path(), "echo");

        assert_eq!(send_command(root.path(), "echo", b"hello").unwrap(), b"hello");
        assert_eq!(send_command(root.path(), "echo", b"").unwrap(), b"");

        let big: Vec<u8> = (0..1 << 20).map(|i| b'a' + (i % 26) as u8).collect();
        assert_eq!(send_command(root.path(), "echo", &big).unwrap(), big);
        server.stop();
    }

    #[test]
    fn test_connection_reuse_and_pipelining() {
        let root = tempfile::tempdir().unwrap();
        let server = echo_server(root.path(), "reuse");

        let mut client = RpcClient::connect(root.path(), "reuse").unwrap();
        assert_eq!(client.dest(), "reuse");
        assert_eq!(client.send(b"first").unwrap(), b"first");
        assert_eq!(client.send(b"second").unwrap(), b"second");

        let replies = client
            .send_pipelined(&[b"a".as_slice(), b"bb", b"", b"ccc"])
            .unwrap();
        assert_eq!(replies, vec![b"a".to_vec(), b"bb".to_vec(), b"".to_vec(), b"ccc".to_vec()]);

        assert!(matches!(
            client.send_pipelined(&[b"ok".as_slice(), b"n\0ul"]),
            Err(Error::InvalidArgument(_))
        ));
        // Rejected batch sent nothing; the connection stays in step.
        assert_eq!(client.send(b"after").unwrap(), b"after");
        drop(client);
        server.stop();
    }

    #[test]
    fn test_request_with_nul_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            send_command(root.path(), "echo", b"a\0b"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_server() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            send_command(root.path(), "nobody", b"hi"),
            Err(Error::NotFound { .. })
        ));

        std::fs::create_dir(root.path().join(COMM_DIR)).unwrap();
        assert!(matches!(
            send_command(root.path(), "nobody", b"hi"),
            Err(Error::NotFound { .. })
        ));

        assert!(matches!(
            send_command(root.path(), "bad/name", b"hi"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reply_limit() {
        let root = tempfile::tempdir().unwrap();
        let server = echo_server(root.path(), "bounded");

        let reply = send_command_limited(root.path(), "bounded", b"short", Some(8)).unwrap();
        assert_eq!(reply, b"short");
        assert!(matches!(
            send_command_limited(root.path(), "bounded", &[b'z'; 100], Some(8)),
            Err(Error::Unavailable { .. })
        ));
        server.stop();
    }
}
