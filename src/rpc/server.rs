//! Threaded request/reply server on a named UNIX socket
//!
//! One accept thread plus one worker thread per live connection. The roster
//! of live connections is guarded by a mutex; a condition variable blocks the
//! accept loop while the roster is at `max_clients`.
//!
//! # Shutdown
//!
//! [`RpcServer::stop`] sets a stopping flag, wakes the admission wait and a
//! blocked `accept`, then shuts down every registered socket so workers
//! return from their reads. Each worker owns a [`ConnectionGuard`] that
//! deregisters it on every exit path. All threads are joined before `stop`
//! returns.

use super::framing::{is_frameable, write_message, MessageBuffer};
use super::handler::CommandHandler;
use super::log::{LogDestination, ServerLog};
use super::{socket_path, COMM_DIR, LOGS_DIR};
use crate::error::{Error, Result};
use rustix::fs::{flock, FlockOperation};
use std::collections::HashMap;
use std::fs::{self, DirBuilder, File};
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Mode for directories created under the root
const DIR_MODE: u32 = 0o755;

/// Server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Most connections served at once; 0 means unbounded. Further clients
    /// wait in the listen backlog until a slot frees.
    pub max_clients: usize,
    /// Largest accepted request in bytes; `None` means unbounded.
    pub max_message_len: Option<usize>,
}

#[derive(Default)]
struct Roster {
    /// Second handle to each connection's socket, used to cancel its worker
    conns: HashMap<u64, UnixStream>,
}

struct Shared {
    name: String,
    socket_path: PathBuf,
    config: ServerConfig,
    handler: Box<dyn CommandHandler>,
    log: ServerLog,
    stopping: AtomicBool,
    roster: Mutex<Roster>,
    slot_freed: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn roster(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Block while the roster is full. Returns `false` once stopping.
    fn wait_for_slot(&self) -> bool {
        let max = self.config.max_clients;
        let mut roster = self.roster();
        while max > 0 && roster.conns.len() >= max && !self.is_stopping() {
            roster = self
                .slot_freed
                .wait(roster)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !self.is_stopping()
    }

    fn deregister(&self, id: u64) -> bool {
        let mut roster = self.roster();
        let Some(stream) = roster.conns.remove(&id) else {
            return false;
        };
        drop(stream);
        let max = self.config.max_clients;
        if max > 0 && roster.conns.len() < max {
            self.slot_freed.notify_one();
        }
        true
    }

    /// Report a failure that ended one connection.
    fn connection_failed(&self, id: u64, reason: &str) {
        let message = format!("client {id} on '{}': {reason}", self.name);
        tracing::warn!(server = %self.name, client = id, "{reason}");
        self.log.write(&message);
        self.handler.notify(&message);
    }

    /// Report a failure that ended the accept loop.
    fn accept_failed(&self, reason: &str) {
        let message = format!("accept loop of '{}' stopped: {reason}", self.name);
        tracing::error!(server = %self.name, "{message}");
        self.log.write(&message);
        self.handler.notify(&message);
    }
}

/// Deregisters a connection when its worker exits, however it exits
struct ConnectionGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.shared.deregister(self.id) {
            tracing::debug!(server = %self.shared.name, client = self.id, "client disconnected");
            self.shared
                .log
                .write(&format!("client {} disconnected", self.id));
        }
    }
}

/// Holds `flock(LOCK_EX)` on the comm directory while registering
struct DirLock {
    dir: File,
}

impl DirLock {
    fn acquire(path: &Path) -> Result<Self> {
        let dir = File::open(path)
            .map_err(|e| Error::from_os(format!("opening {}", path.display()), e))?;
        flock(&dir, FlockOperation::LockExclusive)
            .map_err(|e| Error::unavailable(format!("locking {}", path.display()), e.into()))?;
        Ok(Self { dir })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = flock(&self.dir, FlockOperation::Unlock);
    }
}

/// Unlinks a freshly bound socket unless registration completes
struct BoundSocket<'a> {
    path: &'a Path,
    armed: bool,
}

impl BoundSocket<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for BoundSocket<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(self.path);
        }
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(Error::ResourceExhausted {
            what: format!("creating {}", path.display()),
            source: e,
        }),
    }
}

/// A running server
pub struct RpcServer {
    shared: Arc<Shared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Register `name` under `root` and start serving.
    ///
    /// Creates `root/comm` and `root/logs` if needed. Registrations under one
    /// root are serialized by an exclusive lock on `root/comm`. Fails with
    /// [`Error::AlreadyRunning`] if `root/comm/<name>.sock` already exists.
    pub fn init<H: CommandHandler>(
        root: impl AsRef<Path>,
        name: &str,
        handler: H,
        log: LogDestination,
        config: ServerConfig,
    ) -> Result<Self> {
        let root = root.as_ref();
        let path = socket_path(root, name)?;

        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::NotFound {
                    what: format!("root {}", root.display()),
                    source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
                })
            }
            Err(source) => {
                return Err(Error::NotFound {
                    what: format!("root {}", root.display()),
                    source,
                })
            }
        }

        let logs_dir = root.join(LOGS_DIR);
        let comm_dir = root.join(COMM_DIR);
        ensure_dir(&logs_dir)?;
        ensure_dir(&comm_dir)?;

        let dir_lock = DirLock::acquire(&comm_dir)?;

        let listener = UnixListener::bind(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                Error::AlreadyRunning {
                    name: name.to_string(),
                    path: path.clone(),
                }
            } else {
                Error::from_os(format!("binding {}", path.display()), e)
            }
        })?;
        let bound = BoundSocket {
            path: &path,
            armed: true,
        };

        let log = ServerLog::open(log, &logs_dir, name)?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            socket_path: path.clone(),
            config,
            handler: Box::new(handler),
            log,
            stopping: AtomicBool::new(false),
            roster: Mutex::new(Roster::default()),
            slot_freed: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        shared.log.write(&format!("listening on {}", path.display()));

        let accept_thread = thread::Builder::new()
            .name(format!("upc-{name}"))
            .spawn({
                let shared = Arc::clone(&shared);
                move || accept_loop(shared, listener)
            })
            .map_err(|e| Error::from_os("starting accept thread", e))?;

        bound.keep();
        drop(dir_lock);

        tracing::info!(server = name, path = %path.display(), "listening");

        Ok(Self {
            shared,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Path of the log file when the server opened it itself
    pub fn log_path(&self) -> Option<&Path> {
        self.shared.log.path()
    }

    /// Number of connections currently being served
    pub fn active_connections(&self) -> usize {
        self.shared.roster().conns.len()
    }

    /// Cancel the accept loop and every connection, wait for all of them,
    /// then remove the socket and close the log.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(accept_thread) = self.accept_thread.take() else {
            return;
        };
        let shared = &self.shared;

        shared.stopping.store(true, Ordering::SeqCst);
        {
            let _roster = shared.roster();
            shared.slot_freed.notify_all();
        }
        wake_accept(&shared.socket_path);
        let _ = accept_thread.join();

        for stream in shared.roster().conns.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let workers = std::mem::take(&mut *shared.workers());
        for worker in workers {
            let _ = worker.join();
        }

        if let Err(e) = fs::remove_file(&shared.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(server = %shared.name, "removing socket failed: {e}");
            }
        }

        tracing::info!(server = %shared.name, "stopped");
        shared.log.write("stopped");
        shared.log.flush();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connect to our own socket without blocking so a pending `accept` returns.
fn wake_accept(path: &Path) {
    use rustix::net::{connect_unix, socket_with, AddressFamily, SocketAddrUnix, SocketFlags, SocketType};

    let Ok(addr) = SocketAddrUnix::new(path) else {
        return;
    };
    if let Ok(fd) = socket_with(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
        None,
    ) {
        // Refused or backlog full both mean accept is not blocked.
        let _ = connect_unix(&fd, &addr);
    }
}

fn accept_loop(shared: Arc<Shared>, listener: UnixListener) {
    loop {
        if !shared.wait_for_slot() {
            break;
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
            Err(e) => {
                if !shared.is_stopping() {
                    shared.accept_failed(&e.to_string());
                }
                break;
            }
        };

        if shared.is_stopping() {
            break;
        }

        if let Err(e) = start_worker(&shared, stream) {
            shared.accept_failed(&format!("cannot start connection worker: {e}"));
            break;
        }
    }
}

fn start_worker(shared: &Arc<Shared>, stream: UnixStream) -> io::Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let cancel_handle = stream.try_clone()?;

    // Registering under the roster lock keeps the worker's cleanup from
    // running before its entry exists.
    let mut roster = shared.roster();
    let worker = thread::Builder::new().name(format!("upc-conn-{id}")).spawn({
        let shared = Arc::clone(shared);
        move || serve_connection(shared, id, stream)
    })?;
    roster.conns.insert(id, cancel_handle);
    drop(roster);

    let mut workers = shared.workers();
    workers.retain(|w| !w.is_finished());
    workers.push(worker);
    Ok(())
}

fn serve_connection(shared: Arc<Shared>, id: u64, mut stream: UnixStream) {
    let _cleanup = ConnectionGuard {
        shared: Arc::clone(&shared),
        id,
    };
    tracing::debug!(server = %shared.name, client = id, "client connected");
    shared.log.write(&format!("client {id} connected"));

    let mut inbox = MessageBuffer::new(shared.config.max_message_len);
    while !shared.is_stopping() {
        let request = match inbox.read_message(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                if !shared.is_stopping() {
                    shared.connection_failed(id, &format!("receive failed: {e}"));
                }
                break;
            }
        };

        let reply = match shared.handler.handle(&request) {
            Ok(reply) => reply,
            Err(e) => {
                shared.connection_failed(id, &format!("command handler failed: {e}"));
                break;
            }
        };
        if !is_frameable(&reply) {
            shared.connection_failed(id, "command handler reply contains NUL");
            break;
        }

        if let Err(e) = write_message(&mut stream, &reply) {
            if !shared.is_stopping() {
                shared.connection_failed(id, &format!("send failed: {e}"));
            }
            break;
        }
    }
}
