//! Producer publishes frames into a shared buffer while consumers lock it
//! through the producer's RPC server and read the payload from their own
//! read-only mapping.

use frameshare::{
    handler_fn, send_command, BufferView, HandlerError, LogDestination, RpcClient, RpcServer,
    ServerConfig, SharedBuffer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const FRAME_LEN: usize = 64 * 1024;

fn unique(tag: &str) -> String {
    format!("fs_it_{tag}_{}", std::process::id())
}

/// Minimal control vocabulary for one buffer called `cam`.
fn control(buffer: Arc<SharedBuffer>, enabled: Arc<AtomicBool>) -> impl frameshare::CommandHandler {
    handler_fn(
        move |request| {
            let text = std::str::from_utf8(request).map_err(|e| HandlerError::new(e.to_string()))?;
            let reply = match text.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["set", "cam", "up"] => {
                    enabled.store(true, Ordering::SeqCst);
                    "ACK".to_string()
                }
                ["set", "cam", "down"] => {
                    enabled.store(false, Ordering::SeqCst);
                    "ACK".to_string()
                }
                ["read", "cam", _] if !enabled.load(Ordering::SeqCst) => "DOWN".to_string(),
                ["read", "cam", "lock"] => {
                    buffer.read_lock();
                    format!("ACK {}", buffer.current_frame())
                }
                ["read", "cam", "release"] => {
                    buffer.read_release();
                    "ACK".to_string()
                }
                _ => "UNKNOWN".to_string(),
            };
            Ok(reply.into_bytes())
        },
        |_| {},
    )
}

fn spawn_producer(buffer: Arc<SharedBuffer>, running: Arc<AtomicBool>) -> thread::JoinHandle<u32> {
    thread::spawn(move || {
        let mut published = 0;
        loop {
            let mut frame = buffer.write();
            let next = (frame.frame() + 1) % frameshare::FRAME_SEQ_MODULUS;
            frame.payload_mut().fill(next as u8);
            frame.publish();
            drop(frame);
            published += 1;
            if !running.load(Ordering::SeqCst) {
                break;
            }
            thread::yield_now();
        }
        published
    })
}

#[test]
fn consumers_read_consistent_frames_under_remote_lock() {
    let root = tempfile::tempdir().unwrap();
    let buffer = Arc::new(SharedBuffer::create(&unique("consistent"), FRAME_LEN).unwrap());
    let enabled = Arc::new(AtomicBool::new(true));
    let server = RpcServer::init(
        root.path(),
        "producer",
        control(Arc::clone(&buffer), enabled),
        LogDestination::Disabled,
        ServerConfig::default(),
    )
    .unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let producer = spawn_producer(Arc::clone(&buffer), Arc::clone(&running));

    let start = Arc::new(Barrier::new(3));
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let root = root.path().to_path_buf();
            let name = buffer.name().to_string();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let view = BufferView::open(&name, FRAME_LEN).unwrap();
                let mut client = RpcClient::connect(&root, "producer").unwrap();
                let mut copy = vec![0u8; FRAME_LEN];
                start.wait();

                for _ in 0..50 {
                    let reply = String::from_utf8(client.send(b"read cam lock").unwrap()).unwrap();
                    let frame: u32 = reply.strip_prefix("ACK ").unwrap().parse().unwrap();
                    assert!(frame < frameshare::FRAME_SEQ_MODULUS);
                    assert_eq!(view.current_frame(), frame);
                    assert_eq!(view.copy_to(&mut copy), FRAME_LEN);
                    assert_eq!(client.send(b"read cam release").unwrap(), b"ACK");

                    assert!(
                        copy.iter().all(|b| u32::from(*b) == frame),
                        "torn frame {frame}"
                    );
                }
            })
        })
        .collect();

    for consumer in consumers {
        consumer.join().unwrap();
    }
    running.store(false, Ordering::SeqCst);
    assert!(producer.join().unwrap() > 0);

    assert_eq!(buffer.reader_count(), 0);
    assert!(!buffer.writer_active());
    server.stop();
}

#[test]
fn disabled_buffer_answers_down() {
    let root = tempfile::tempdir().unwrap();
    let buffer = Arc::new(SharedBuffer::create(&unique("down"), 4096).unwrap());
    let enabled = Arc::new(AtomicBool::new(true));
    let server = RpcServer::init(
        root.path(),
        "producer",
        control(Arc::clone(&buffer), Arc::clone(&enabled)),
        LogDestination::Disabled,
        ServerConfig::default(),
    )
    .unwrap();

    assert_eq!(send_command(root.path(), "producer", b"set cam down").unwrap(), b"ACK");
    assert!(!enabled.load(Ordering::SeqCst));
    assert_eq!(send_command(root.path(), "producer", b"read cam lock").unwrap(), b"DOWN");
    assert_eq!(buffer.reader_count(), 0);

    assert_eq!(send_command(root.path(), "producer", b"set cam up").unwrap(), b"ACK");
    assert_eq!(send_command(root.path(), "producer", b"read cam lock").unwrap(), b"ACK 0");
    assert_eq!(buffer.reader_count(), 1);
    assert_eq!(send_command(root.path(), "producer", b"read cam release").unwrap(), b"ACK");
    assert_eq!(buffer.reader_count(), 0);

    assert_eq!(send_command(root.path(), "producer", b"fly away").unwrap(), b"UNKNOWN");
    server.stop();
}

#[test]
fn view_keeps_mapping_after_owner_unlinks() {
    let name = unique("owner");
    let buffer = SharedBuffer::create(&name, 1024).unwrap();
    let view = BufferView::open(&name, 1024).unwrap();
    drop(buffer);

    // Existing mapping stays readable; the name is gone.
    assert_eq!(view.current_frame(), 0);
    assert!(matches!(
        BufferView::open(&name, 1024),
        Err(frameshare::Error::NotFound { .. })
    ));
}
