use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sbuffer::{ReaderId, SharedBuffer};

fn main() {
    divan::main();
}

#[global_allocator]
static ALLOC: divan::AllocProfiler = divan::AllocProfiler::system();

#[derive(Clone, Copy)]
struct Sample {
    _id: u16,
    _value: f64,
    _ts: i64,
}

const SAMPLE: Sample = Sample {
    _id: 1,
    _value: 21.5,
    _ts: 1_700_000_000,
};

fn drain(buffer: &SharedBuffer<Sample>, reader: ReaderId) -> usize {
    let mut count = 0;
    while let Some(sample) = buffer.read(reader, false).into_item() {
        black_box(sample);
        count += 1;
    }
    count
}

#[divan::bench(args = [16, 256, 4096])]
fn bench_insert_then_drain(bencher: divan::Bencher, backlog: usize) {
    bencher
        .with_inputs(|| SharedBuffer::new(Duration::from_millis(10)))
        .bench_values(|buffer| {
            for _ in 0..backlog {
                buffer.insert(SAMPLE).unwrap();
            }
            drain(&buffer, ReaderId::Analytics);
            drain(&buffer, ReaderId::Persistence);
            buffer.remove_consumed();
        });
}

#[divan::bench(args = [1_000, 10_000])]
fn bench_concurrent_readers(bencher: divan::Bencher, total: usize) {
    bencher.bench_local(|| {
        let buffer = Arc::new(SharedBuffer::new(Duration::from_millis(1)));
        let readers: Vec<_> = ReaderId::ALL
            .into_iter()
            .map(|reader| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    let mut seen = 0;
                    while seen < total {
                        if buffer.read(reader, true).into_item().is_some() {
                            seen += 1;
                        }
                    }
                })
            })
            .collect();

        for _ in 0..total {
            buffer.insert(SAMPLE).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    });
}
