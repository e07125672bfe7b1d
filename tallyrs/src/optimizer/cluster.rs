use futures::future::try_join_all;
use tracing::debug;

use crate::backends::Warehouse;
use crate::error::Result;
use crate::registry::SchemaRegistry;
use crate::schema::DataType;

/// Pick clustering columns: groupable, non-date dimensions by approximate
/// cardinality, highest first, at most `max_columns`.
///
/// Ties keep declaration order. Calculated dimensions are not physical columns
/// and are never candidates.
pub async fn detect_cluster_columns(
    registry: &SchemaRegistry,
    warehouse: &dyn Warehouse,
    max_columns: usize,
) -> Result<Vec<String>> {
    let mut candidates: Vec<&str> = Vec::new();
    for dim in registry.dimensions() {
        if dim.is_groupable
            && dim.data_type != DataType::Date
            && dim.column_name != registry.date_column()
            && !candidates.contains(&dim.column_name.as_str())
        {
            candidates.push(&dim.column_name);
        }
    }
    if candidates.is_empty() || max_columns == 0 {
        return Ok(Vec::new());
    }

    let source = registry.source_table();
    let cardinalities = try_join_all(
        candidates
            .iter()
            .map(|col| warehouse.approx_cardinality(source, col)),
    )
    .await?;

    let mut ranked: Vec<(&str, u64)> = candidates.into_iter().zip(cardinalities).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    debug!(table = registry.table(), ranked = ?ranked, "ranked cluster candidates");
    Ok(ranked
        .into_iter()
        .take(max_columns)
        .map(|(col, _)| col.to_string())
        .collect())
}
