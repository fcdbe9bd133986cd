use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use frameshare::{
    handler_fn, LogDestination, RpcClient, RpcServer, ServerConfig, SharedBuffer,
};

fn shm_name(tag: &str) -> String {
    format!("fs_bench_{tag}_{}", std::process::id())
}

fn bench_buffer_locks(c: &mut Criterion) {
    let buffer = SharedBuffer::create(&shm_name("locks"), 1280 * 720 * 3).unwrap();
    let mut group = c.benchmark_group("shmbuf");

    group.bench_function("read_lock_release", |b| {
        b.iter(|| {
            buffer.read_lock();
            black_box(buffer.current_frame());
            buffer.read_release();
        })
    });

    group.throughput(Throughput::Bytes(buffer.len() as u64));
    group.bench_function("write_publish_720p", |b| {
        let mut tick = 0u8;
        b.iter(|| {
            let mut frame = buffer.write();
            frame.payload_mut().fill(tick);
            black_box(frame.publish());
            tick = tick.wrapping_add(1);
        })
    });

    group.finish();
}

fn bench_rpc_round_trip(c: &mut Criterion) {
    let root = tempfile::tempdir().unwrap();
    let server = RpcServer::init(
        root.path(),
        "bench",
        handler_fn(|_| Ok(b"ACK 0".to_vec()), |_| {}),
        LogDestination::Disabled,
        ServerConfig::default(),
    )
    .unwrap();
    let mut group = c.benchmark_group("rpc");

    group.bench_function("persistent_connection", |b| {
        let mut client = RpcClient::connect(root.path(), "bench").unwrap();
        b.iter(|| black_box(client.send(b"read left lock").unwrap()))
    });

    group.bench_function("send_command", |b| {
        b.iter(|| black_box(frameshare::send_command(root.path(), "bench", b"read left lock").unwrap()))
    });

    group.bench_function("pipelined_x16", |b| {
        let mut client = RpcClient::connect(root.path(), "bench").unwrap();
        let batch = [b"read left lock".as_slice(); 16];
        b.iter(|| black_box(client.send_pipelined(&batch).unwrap()))
    });

    group.finish();
    server.stop();
}

criterion_group!(benches, bench_buffer_locks, bench_rpc_round_trip);
criterion_main!(benches);
