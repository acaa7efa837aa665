pub mod cycle_finder;
pub mod test_pool;
pub mod trace_graph;
pub mod trace_pool;
pub mod trace_selector;

pub use cycle_finder::{compress_blocks, find_cycle_brent, find_cycles, find_cycles_brent, Cycle};
pub use test_pool::{Admission, TestPool};
pub use trace_graph::{InsertOutcome, TraceGraph};
pub use trace_pool::{GraphExport, TracePool, TracePoolOptions};
pub use trace_selector::{BlockWeights, TraceSelector};
