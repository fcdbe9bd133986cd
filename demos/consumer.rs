//! Frame consumer (reader/client)
//!
//! Maps a producer's buffer read-only, enables the stream, then repeatedly
//! takes a read lock over RPC, copies the frame when its number changed,
//! and releases the lock.
//!
//! Run: `cargo run --example consumer -- watch left`

use clap::{Parser, Subcommand};
use frameshare::rpc::default_root;
use frameshare::{send_command, BufferView, RpcClient};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "consumer")]
#[command(about = "Read frames published by a producer", long_about = None)]
struct Cli {
    /// Socket root (defaults to $HOME/rover)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Producer server name
    #[arg(short, long, global = true, default_value = "cvzshare")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable a stream and copy frames as they change
    Watch {
        /// Stream name
        buffer: String,

        /// Frame width in pixels
        #[arg(long, default_value = "640")]
        width: usize,

        /// Frame height in pixels
        #[arg(long, default_value = "360")]
        height: usize,

        /// Stop after this many new frames (0 runs until the stream goes down)
        #[arg(short, long, default_value = "0")]
        frames: u64,

        /// Pause between polls in milliseconds
        #[arg(long, default_value = "10")]
        poll_ms: u64,
    },
    /// Send one raw command and print the reply
    Send {
        /// Command words, joined with spaces
        #[arg(required = true)]
        words: Vec<String>,
    },
}

enum Lock {
    Frame(u32),
    Down,
}

fn parse_lock_reply(reply: &[u8]) -> Option<Lock> {
    match reply {
        b"DOWN" => Some(Lock::Down),
        _ => std::str::from_utf8(reply)
            .ok()?
            .strip_prefix("ACK ")?
            .parse()
            .ok()
            .map(Lock::Frame),
    }
}

fn fail(message: String) -> ! {
    eprintln!("[Consumer] {}", message);
    std::process::exit(1);
}

fn watch(
    root: &Path,
    server: &str,
    buffer: &str,
    frame_len: usize,
    max_frames: u64,
    poll: Duration,
) {
    let shm_name = format!("{server}_{buffer}");
    let view = BufferView::open(&shm_name, frame_len)
        .unwrap_or_else(|e| fail(format!("Cannot map '{}': {}", shm_name, e)));

    let mut client = RpcClient::connect(root, server)
        .unwrap_or_else(|e| fail(format!("Cannot reach '{}': {}", server, e)));
    match client.send(format!("set {buffer} up").as_bytes()) {
        Ok(reply) if reply == b"ACK" => {}
        Ok(reply) => fail(format!("Enable refused: {}", String::from_utf8_lossy(&reply))),
        Err(e) => fail(format!("Enable failed: {}", e)),
    }

    let lock = format!("read {buffer} lock");
    let release = format!("read {buffer} release");
    let mut copy = vec![0u8; view.len()];
    let mut last: Option<u32> = None;
    let mut loaded = 0u64;
    let started = Instant::now();

    loop {
        let reply = match client.send(lock.as_bytes()) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[Consumer] Lock failed: {}", e);
                break;
            }
        };
        let frame = match parse_lock_reply(&reply) {
            Some(Lock::Frame(n)) => n,
            Some(Lock::Down) => {
                println!("[Consumer] Stream '{}' is down", buffer);
                break;
            }
            None => {
                eprintln!("[Consumer] Unexpected reply: {}", String::from_utf8_lossy(&reply));
                break;
            }
        };

        let fresh = last != Some(frame);
        if fresh {
            last = Some(frame);
            view.copy_to(&mut copy);
            loaded += 1;
        }

        if let Err(e) = client.send(release.as_bytes()) {
            eprintln!("[Consumer] Release failed: {}", e);
            break;
        }

        if fresh && loaded % 30 == 0 {
            let sum: u64 = copy.iter().map(|b| u64::from(*b)).sum();
            println!(
                "[Consumer] frame {:2} | loaded {} | {:.1} fps | checksum {}",
                frame,
                loaded,
                loaded as f64 / started.elapsed().as_secs_f64(),
                sum
            );
        }
        if max_frames > 0 && loaded >= max_frames {
            break;
        }
        std::thread::sleep(poll);
    }

    println!("[Consumer] Loaded {} frames", loaded);
}

fn main() {
    let cli = Cli::parse();
    let root = cli
        .root
        .or_else(default_root)
        .unwrap_or_else(|| fail("No --root given and HOME is unset".to_string()));

    match cli.command {
        Commands::Watch {
            buffer,
            width,
            height,
            frames,
            poll_ms,
        } => watch(
            &root,
            &cli.server,
            &buffer,
            width * height * 3,
            frames,
            Duration::from_millis(poll_ms),
        ),
        Commands::Send { words } => {
            let command = words.join(" ");
            match send_command(&root, &cli.server, command.as_bytes()) {
                Ok(reply) => println!("{}", String::from_utf8_lossy(&reply)),
                Err(e) => fail(format!("'{}' failed: {}", command, e)),
            }
        }
    }
}
