//! Frame producer (writer/server)
//!
//! Creates one shared buffer per named stream, publishes synthetic frames
//! into the enabled ones, and serves the control vocabulary consumers use:
//!
//! ```text
//! set <buf> up|down     -> ACK
//! get <buf> status      -> UP | DOWN
//! read <buf> lock       -> ACK <frame> | DOWN
//! read <buf> release    -> ACK
//! anything else         -> UNKNOWN
//! ```
//!
//! Run: `cargo run --example producer -- --buffers left,right`

use clap::Parser;
use frameshare::rpc::default_root;
use frameshare::{
    handler_fn, CommandHandler, LogDestination, RpcServer, ServerConfig, SharedBuffer,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "producer")]
#[command(about = "Publish synthetic frames over shared memory", long_about = None)]
struct Args {
    /// Socket root (defaults to $HOME/rover)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Server name consumers address
    #[arg(short, long, default_value = "cvzshare")]
    name: String,

    /// Comma separated stream names
    #[arg(short, long, value_delimiter = ',', default_value = "left,right")]
    buffers: Vec<String>,

    /// Frame width in pixels
    #[arg(long, default_value = "640")]
    width: usize,

    /// Frame height in pixels
    #[arg(long, default_value = "360")]
    height: usize,

    /// Frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Stop after this many seconds (0 runs forever)
    #[arg(long, default_value = "0")]
    seconds: u64,

    /// Maximum concurrent consumer connections (0 = unbounded)
    #[arg(long, default_value = "0")]
    max_clients: usize,
}

/// One published stream
struct Stream {
    buffer: SharedBuffer,
    enabled: AtomicBool,
}

fn shm_name(server: &str, buffer: &str) -> String {
    format!("{server}_{buffer}")
}

fn control(streams: Arc<HashMap<String, Stream>>) -> impl CommandHandler {
    handler_fn(
        move |request| {
            let text = String::from_utf8_lossy(request);
            let words: Vec<&str> = text.split_whitespace().collect();
            let reply = match words.as_slice() {
                ["set", buf, state @ ("up" | "down")] => match streams.get(*buf) {
                    Some(stream) => {
                        stream.enabled.store(*state == "up", Ordering::SeqCst);
                        "ACK".to_string()
                    }
                    None => "UNKNOWN".to_string(),
                },
                ["get", buf, "status"] => match streams.get(*buf) {
                    Some(stream) if stream.enabled.load(Ordering::SeqCst) => "UP".to_string(),
                    Some(_) => "DOWN".to_string(),
                    None => "UNKNOWN".to_string(),
                },
                ["read", buf, "lock"] => match streams.get(*buf) {
                    Some(stream) if stream.enabled.load(Ordering::SeqCst) => {
                        stream.buffer.read_lock();
                        format!("ACK {}", stream.buffer.current_frame())
                    }
                    Some(_) => "DOWN".to_string(),
                    None => "UNKNOWN".to_string(),
                },
                ["read", buf, "release"] => match streams.get(*buf) {
                    Some(stream) => {
                        stream.buffer.read_release();
                        "ACK".to_string()
                    }
                    None => "UNKNOWN".to_string(),
                },
                _ => "UNKNOWN".to_string(),
            };
            Ok(reply.into_bytes())
        },
        |message| eprintln!("[Producer] Server error: {}", message),
    )
}

/// Moving gradient, different per stream, so consumers can see tearing.
fn paint(payload: &mut [u8], width: usize, tick: u64, seed: u8) {
    for (row, line) in payload.chunks_mut(width * 3).enumerate() {
        for (col, px) in line.chunks_mut(3).enumerate() {
            let v = (col as u64 + row as u64 + tick) as u8;
            px.copy_from_slice(&[v, v.wrapping_add(seed), tick as u8]);
        }
    }
}

fn main() {
    let args = Args::parse();
    let root = match args.root.or_else(default_root) {
        Some(root) => root,
        None => {
            eprintln!("[Producer] No --root given and HOME is unset");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&root) {
        eprintln!("[Producer] Cannot create {}: {}", root.display(), e);
        std::process::exit(1);
    }

    let frame_len = args.width * args.height * 3;
    let mut streams = HashMap::new();
    for name in &args.buffers {
        let buffer = match SharedBuffer::create(&shm_name(&args.name, name), frame_len) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("[Producer] Failed to create buffer '{}': {}", name, e);
                std::process::exit(1);
            }
        };
        println!("[Producer] Buffer '{}' -> /{} ({} bytes)", name, buffer.name(), frame_len);
        streams.insert(
            name.clone(),
            Stream {
                buffer,
                enabled: AtomicBool::new(false),
            },
        );
    }
    let streams = Arc::new(streams);

    let config = ServerConfig {
        max_clients: args.max_clients,
        ..Default::default()
    };
    let server = match RpcServer::init(
        &root,
        &args.name,
        control(Arc::clone(&streams)),
        LogDestination::Internal,
        config,
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Producer] Failed to start server: {}", e);
            std::process::exit(1);
        }
    };
    println!("[Producer] Listening on {}", server.socket_path().display());

    let period = Duration::from_secs(1) / args.fps.max(1);
    let started = Instant::now();
    let mut tick = 0u64;
    while args.seconds == 0 || started.elapsed() < Duration::from_secs(args.seconds) {
        let deadline = Instant::now() + period;
        for (seed, name) in args.buffers.iter().enumerate() {
            let Some(stream) = streams.get(name) else { continue };
            if !stream.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let mut frame = stream.buffer.write();
            paint(frame.payload_mut(), args.width, tick, (seed as u8).wrapping_mul(64));
            frame.publish();
        }
        tick += 1;
        if tick % u64::from(args.fps.max(1)) == 0 {
            println!(
                "[Producer] tick {} | clients {}",
                tick,
                server.active_connections()
            );
        }
        std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
    }

    server.stop();
    println!("[Producer] Stopped after {} ticks", tick);
}
