use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use concolic_dispatch::domain::models::strategy::SelectionStrategy;
use concolic_dispatch::domain::models::trace::Trace;
use concolic_dispatch::services::cycle_finder::compress_blocks;
use concolic_dispatch::services::trace_graph::TraceGraph;
use concolic_dispatch::services::trace_pool::{TracePool, TracePoolOptions};

// Simple xorshift for reproducible block sequences.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Traces sharing a common prefix and branching on a small block alphabet,
/// the shape a program's paths take.
fn make_traces(count: usize, len: usize, seed: u64) -> Vec<Trace> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|i| {
            let blocks = (0..len)
                .map(|j| if j < len / 4 { j as u64 } else { 0x1000 + rng.next_u64() % 16 })
                .collect();
            Trace::new(format!("t{i}"), blocks).unwrap()
        })
        .collect()
}

/// A loop body repeated `iterations` times between a prologue and epilogue.
fn make_looping(body: usize, iterations: usize) -> Vec<u64> {
    let mut blocks = vec![1, 2, 3];
    for _ in 0..iterations {
        blocks.extend(100..100 + body as u64);
    }
    blocks.extend([7, 8, 9]);
    blocks
}

// ============================================================================
// 1. Graph insertion
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_graph/insert");

    for &count in &[100usize, 1_000] {
        let traces = make_traces(count, 64, 0xdead_beef);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &traces, |b, traces| {
            b.iter(|| {
                let mut graph = TraceGraph::new();
                for trace in traces {
                    black_box(graph.insert(trace).unwrap());
                }
                graph
            })
        });
    }

    group.finish();
}

// ============================================================================
// 2. Selection strategies
// ============================================================================

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_graph/drain");
    let traces = make_traces(500, 48, 0xcafe_babe);

    for strategy in SelectionStrategy::ALL {
        group.bench_function(strategy.as_str(), |b| {
            b.iter(|| {
                let mut pool = TracePool::new(strategy, TracePoolOptions::default());
                for trace in &traces {
                    pool.insert_trace(trace).unwrap();
                }
                while let Some(id) = pool.next_id().unwrap() {
                    black_box(id);
                }
            })
        });
    }

    group.finish();
}

// ============================================================================
// 3. Loop compression
// ============================================================================

fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_finder/compress");

    for &iterations in &[10usize, 100, 1_000] {
        let blocks = make_looping(8, iterations);
        group.throughput(Throughput::Elements(blocks.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(iterations), &blocks, |b, blocks| {
            b.iter(|| compress_blocks(black_box(blocks)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_selection, bench_compress);
criterion_main!(benches);
