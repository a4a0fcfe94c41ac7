use serde::Serialize;

use crate::vector_index::VectorIndex;

/// Snapshot returned by the `health()` admin operation: vector-index
/// reachability plus the collection's current dimension and point count.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub vector_index_reachable: bool,
    pub collection_dimension: usize,
    pub point_count: i64,
    pub error: Option<String>,
}

pub async fn check(vector_index: &dyn VectorIndex) -> HealthReport {
    match vector_index.collection_info().await {
        Ok(info) => HealthReport {
            vector_index_reachable: true,
            collection_dimension: info.dimension,
            point_count: info.point_count,
            error: None,
        },
        Err(e) => HealthReport {
            vector_index_reachable: false,
            collection_dimension: 0,
            point_count: 0,
            error: Some(e.to_string()),
        },
    }
}
