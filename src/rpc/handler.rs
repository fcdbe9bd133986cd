//! Application callbacks invoked by the server

use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a command handler. Ends the offending connection.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// The callback pair a server dispatches to
///
/// `handle` runs on connection worker threads, concurrently across
/// connections, so implementations must be `Sync`.
pub trait CommandHandler: Send + Sync + 'static {
    /// Produce the reply to one request. Both exclude the terminator.
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, HandlerError>;

    /// Asynchronous failure inside the server (accept loop or a connection).
    fn notify(&self, message: &str) {
        let _ = message;
    }
}

impl<H: CommandHandler + ?Sized> CommandHandler for Arc<H> {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        (**self).handle(request)
    }

    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

impl<H: CommandHandler + ?Sized> CommandHandler for Box<H> {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        (**self).handle(request)
    }

    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

/// [`CommandHandler`] built from a pair of closures
pub struct FnHandler<C, N> {
    command: C,
    notify: N,
}

/// Build a handler from a command closure and a notification closure.
pub fn handler_fn<C, N>(command: C, notify: N) -> FnHandler<C, N>
where
    C: Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync + 'static,
    N: Fn(&str) + Send + Sync + 'static,
{
    FnHandler { command, notify }
}

impl<C, N> CommandHandler for FnHandler<C, N>
where
    C: Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync + 'static,
    N: Fn(&str) + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        (self.command)(request)
    }

    fn notify(&self, message: &str) {
        (self.notify)(message)
    }
}
