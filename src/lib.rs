//! FrameShare - zero-copy frame sharing between processes
//!
//! Two independent primitives that together let one producer process publish
//! large buffers (video frames) to any number of consumer processes without
//! the payload ever crossing a socket.
//!
//! # Architecture
//!
//! - **Data plane** ([`shmbuf`]): a named POSIX shared-memory segment with a
//!   single-writer / multi-reader access state guarded by a binary semaphore.
//! - **Control plane** ([`rpc`]): a named request/reply server over a UNIX
//!   domain socket (`root/comm/<name>.sock`) plus a one-shot client. Consumers
//!   ask the producer to take and release read locks on their behalf and learn
//!   the current frame number from the reply.
//!
//! The core never interprets the bytes it moves. Command vocabularies belong
//! to the application (see `demos/`).

pub mod error;
pub mod rpc;
pub mod semaphore;
pub mod shm;
pub mod shmbuf;

pub use error::{Error, Result};
pub use rpc::client::{send_command, send_command_limited, RpcClient};
pub use rpc::handler::{handler_fn, CommandHandler, HandlerError};
pub use rpc::log::LogDestination;
pub use rpc::server::{RpcServer, ServerConfig};
pub use shmbuf::{BufferView, ReadGuard, SharedBuffer, WriteGuard, FRAME_SEQ_MODULUS};
