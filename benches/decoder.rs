use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use kvpool::net::{Decoder, Reply, Request};
use pprof::criterion::{Output, PProfProfiler};
use rand::{distributions::Alphanumeric, prelude::*};

const ITER: usize = 10000;

const ARRAY_LEN: usize = 5;
const ARRAY_NEST: usize = 2;
const STRING_SIZE: usize = 64;
const BULK_SIZE: usize = 256;

fn rand_string(rng: &mut ThreadRng, max: usize) -> String {
    let len = rng.gen_range(0..max);
    rng.sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn rand_reply(rng: &mut ThreadRng, nest: usize) -> Reply {
    match rng.gen_range(0..6) {
        0 => Reply::Status(rand_string(rng, STRING_SIZE)),
        1 => Reply::Error(rand_string(rng, STRING_SIZE)),
        2 => Reply::Integer(rng.gen()),
        3 => Reply::Bulk(rand_string(rng, BULK_SIZE).into()),
        4 if nest < ARRAY_NEST => {
            let len = rng.gen_range(0..ARRAY_LEN);
            Reply::Array((0..len).map(|_| rand_reply(rng, nest + 1)).collect())
        }
        _ => Reply::Null,
    }
}

fn rand_stream() -> BytesMut {
    let mut rng = rand::thread_rng();
    let mut stream = BytesMut::new();
    for _ in 0..ITER {
        rand_reply(&mut rng, 0).write_to(&mut stream);
    }
    stream
}

fn decode_all(stream: &[u8], chunk: usize) -> usize {
    let mut decoder = Decoder::new();
    let mut n = 0;
    for piece in stream.chunks(chunk) {
        decoder.feed(piece);
        while let Some(_reply) = decoder.gets().unwrap() {
            n += 1;
        }
    }
    n
}

pub fn bench_decode(c: &mut Criterion) {
    let stream = rand_stream();

    let mut g = c.benchmark_group("decode_random");
    g.throughput(Throughput::Bytes(stream.len() as u64));
    for chunk in [16, 512, stream.len()] {
        g.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| assert_eq!(decode_all(&stream, chunk), ITER));
        });
    }
    g.finish();
}

pub fn bench_encode(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let requests: Vec<Request> = (0..ITER)
        .map(|_| {
            Request::new("SET")
                .arg(rand_string(&mut rng, STRING_SIZE))
                .arg(rand_string(&mut rng, BULK_SIZE))
        })
        .collect();

    c.bench_function("encode_set", |b| {
        b.iter_batched_ref(
            BytesMut::new,
            |dst| {
                for request in &requests {
                    request.encode_into(dst);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(500, Output::Flamegraph(None)));
    targets = bench_decode, bench_encode
);
criterion_main!(benches);
