//! NUL-terminated message framing
//!
//! Incoming bytes accumulate in a [`MessageBuffer`] that grows in
//! [`MSG_BLOCK`] steps and is compacted after every complete message, so
//! pipelined requests arriving in one read are handed out one at a time.

use crate::error::Error;
use std::collections::TryReserveError;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Read granularity and buffer growth step
pub const MSG_BLOCK: usize = 512;

/// Message terminator
pub const TERMINATOR: u8 = 0;

/// Why a message could not be received
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed the stream partway through a message
    #[error("connection closed with {pending} bytes of an unterminated message")]
    Truncated { pending: usize },

    /// Message grew past the configured guard
    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// Receive buffer could not grow
    #[error("receive buffer allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Map to the crate taxonomy for an exchange described by `what`.
    pub(crate) fn into_error(self, what: &str) -> Error {
        match self {
            FrameError::Alloc(e) => Error::ResourceExhausted {
                what: what.to_string(),
                source: io::Error::new(io::ErrorKind::OutOfMemory, e),
            },
            FrameError::Io(e) => Error::unavailable(what, e),
            e @ FrameError::Truncated { .. } => {
                Error::unavailable(what, io::Error::new(io::ErrorKind::UnexpectedEof, e))
            }
            e @ FrameError::TooLarge { .. } => {
                Error::unavailable(what, io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }
}

/// Growable receive buffer that splits a byte stream into messages
#[derive(Debug)]
pub struct MessageBuffer {
    buf: Vec<u8>,
    /// Bytes already searched for a terminator
    scanned: usize,
    limit: Option<usize>,
}

impl MessageBuffer {
    /// `limit` bounds a single message; `None` accepts any length.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Bytes received but not yet handed out
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message if one is buffered.
    pub fn take_message(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(pos) = self.buf[self.scanned..]
            .iter()
            .position(|b| *b == TERMINATOR)
        else {
            self.scanned = self.buf.len();
            return self.check_limit(self.buf.len()).map(|()| None);
        };

        let end = self.scanned + pos;
        self.check_limit(end)?;

        let mut message = Vec::new();
        message.try_reserve_exact(end)?;
        message.extend_from_slice(&self.buf[..end]);

        self.buf.drain(..=end);
        self.scanned = 0;
        if self.buf.capacity() > 4 * MSG_BLOCK && self.buf.len() < self.buf.capacity() / 4 {
            self.buf.shrink_to(self.buf.len().max(MSG_BLOCK));
        }
        Ok(Some(message))
    }

    /// Read once from `reader` into the buffer. Returns 0 at end of stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, FrameError> {
        let mut chunk = [0u8; MSG_BLOCK];
        let n = loop {
            match reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.buf.try_reserve(n)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Block until a whole message is available.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between messages.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            if let Some(message) = self.take_message()? {
                return Ok(Some(message));
            }
            if self.fill_from(reader)? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated {
                        pending: self.buf.len(),
                    })
                };
            }
        }
    }

    fn check_limit(&self, len: usize) -> Result<(), FrameError> {
        match self.limit {
            Some(limit) if len > limit => Err(FrameError::TooLarge { limit }),
            _ => Ok(()),
        }
    }
}

/// Write `payload` followed by the terminator.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload)?;
    writer.write_all(&[TERMINATOR])?;
    writer.flush()
}

/// Whether `payload` can be sent as one message.
pub fn is_frameable(payload: &[u8]) -> bool {
    !payload.contains(&TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out its data a few bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_pipelined_messages_in_one_read() {
        let mut stream = Cursor::new(b"set left up\0read left lock\0\0".to_vec());
        let mut inbox = MessageBuffer::new(None);

        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"set left up");
        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"read left lock");
        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"");
        assert!(inbox.read_message(&mut stream).unwrap().is_none());
        assert_eq!(inbox.pending(), 0);
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let mut payload = vec![b'x'; 3 * MSG_BLOCK + 17];
        payload.push(TERMINATOR);
        payload.extend_from_slice(b"tail\0");
        let mut stream = Trickle {
            data: payload,
            pos: 0,
            step: 7,
        };
        let mut inbox = MessageBuffer::new(None);

        let first = inbox.read_message(&mut stream).unwrap().unwrap();
        assert_eq!(first.len(), 3 * MSG_BLOCK + 17);
        assert!(first.iter().all(|b| *b == b'x'));
        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"tail");
    }

    #[test]
    fn test_truncated_stream() {
        let mut stream = Cursor::new(b"complete\0partial".to_vec());
        let mut inbox = MessageBuffer::new(None);
        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"complete");
        assert!(matches!(
            inbox.read_message(&mut stream),
            Err(FrameError::Truncated { pending: 7 })
        ));
    }

    #[test]
    fn test_limit_guard() {
        let mut inbox = MessageBuffer::new(Some(4));
        let mut stream = Cursor::new(b"four\0fiver\0".to_vec());
        assert_eq!(inbox.read_message(&mut stream).unwrap().unwrap(), b"four");
        assert!(matches!(
            inbox.read_message(&mut stream),
            Err(FrameError::TooLarge { limit: 4 })
        ));

        // Unterminated data past the limit fails without waiting for the end.
        let mut inbox = MessageBuffer::new(Some(16));
        let mut stream = Cursor::new(vec![b'y'; 64]);
        assert!(matches!(
            inbox.read_message(&mut stream),
            Err(FrameError::TooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_write_message_appends_terminator() {
        let mut out = Vec::new();
        write_message(&mut out, b"ACK 7").unwrap();
        write_message(&mut out, b"").unwrap();
        assert_eq!(out, b"ACK 7\0\0");
        assert!(is_frameable(b"ACK"));
        assert!(!is_frameable(b"A\0CK"));
    }
}
