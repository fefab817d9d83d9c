//! Relay throughput benchmarks

#[cfg(unix)]
mod pipes {
    use std::io::{Read, Write};
    use std::thread;

    use criterion::{black_box, Criterion, Throughput};
    use pty_relay::relay::{Direction, DirectionKind, Transfer};
    use pty_relay::Endpoint;

    const PAYLOAD: usize = 1 << 20;

    fn pipe() -> (Endpoint, Endpoint) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        (Endpoint::from(rx), Endpoint::from(tx))
    }

    /// Push `PAYLOAD` bytes through one direction between two pipes
    fn relay_payload(capacity: usize, payload: &[u8]) -> usize {
        let (source_rx, mut source_tx) = pipe();
        let (mut sink_rx, sink_tx) = pipe();
        let mut direction = Direction::new(DirectionKind::Output, source_rx, sink_tx, capacity);

        let payload = payload.to_vec();
        let writer = thread::spawn(move || source_tx.write_all(&payload).unwrap());
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            loop {
                match sink_rx.read(&mut buf).unwrap() {
                    0 => return total,
                    n => total += n,
                }
            }
        });

        while let Transfer::Forwarded(_) = direction.transfer().unwrap() {}
        drop(direction);
        writer.join().unwrap();
        reader.join().unwrap()
    }

    pub fn bench_direction_transfer(c: &mut Criterion) {
        let mut group = c.benchmark_group("relay");
        let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(PAYLOAD as u64));

        for capacity in [256, 4096, 65536] {
            group.bench_function(format!("transfer_{capacity}"), |b| {
                b.iter(|| black_box(relay_payload(capacity, black_box(&payload))))
            });
        }

        group.finish();
    }
}

#[cfg(unix)]
criterion::criterion_group!(benches, pipes::bench_direction_transfer);
#[cfg(unix)]
criterion::criterion_main!(benches);

#[cfg(not(unix))]
fn main() {}
