//! Built-in MapReduce applications, looked up by name.

use common::Workload;

pub mod vertex_degree;
pub mod word_count;

/// Names accepted by [`try_named`].
pub const WORKLOADS: &[&str] = &["wc", "vertex-degree"];

/// Retrieve a workload by its name.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: word_count::map,
            reduce_fn: word_count::reduce,
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            reduce_fn: vertex_degree::reduce,
        }),
        _ => None,
    }
}
