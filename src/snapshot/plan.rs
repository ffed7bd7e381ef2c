//! Chunk planning and table dispatch order

use std::collections::{BTreeMap, BTreeSet};

use super::{ChunkRange, TableInfo};

/// Split a table into row ranges of roughly `chunk_bytes` each, using the
/// catalog's average row width. Tables without estimates get one open range.
pub fn plan_chunks(table: &TableInfo, chunk_bytes: u64) -> Vec<ChunkRange> {
    let chunk_bytes = chunk_bytes.max(1);
    if table.rows_estimate == 0 || table.bytes_estimate <= chunk_bytes {
        return vec![ChunkRange {
            index: 0,
            offset: 0,
            limit: None,
        }];
    }

    let avg_row = (table.bytes_estimate / table.rows_estimate).max(1);
    let rows_per_chunk = (chunk_bytes / avg_row).max(1);
    let count = table.rows_estimate.div_ceil(rows_per_chunk);

    (0..count)
        .map(|i| ChunkRange {
            index: i as u32,
            offset: i * rows_per_chunk,
            limit: if i + 1 == count {
                None
            } else {
                Some(rows_per_chunk)
            },
        })
        .collect()
}

/// Order tables parents-first along foreign keys (Kahn's algorithm).
///
/// Ties break on qualified name so the order is deterministic. Tables left
/// over by a reference cycle are appended in name order; constraints are
/// only created after the load, so a cycle cannot break it.
pub fn dependency_order(tables: Vec<TableInfo>) -> Vec<TableInfo> {
    let mut by_name: BTreeMap<String, TableInfo> = tables
        .into_iter()
        .map(|t| (t.qualified_name(), t))
        .collect();

    let mut in_degree: BTreeMap<String, usize> = by_name.keys().map(|k| (k.clone(), 0)).collect();
    let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (name, table) in &by_name {
        let parents: BTreeSet<&String> = table
            .depends_on
            .iter()
            .filter(|p| *p != name && by_name.contains_key(*p))
            .collect();
        for parent in parents {
            children.entry(parent.clone()).or_default().insert(name.clone());
            *in_degree.entry(name.clone()).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut ordered = Vec::with_capacity(by_name.len());

    while let Some(current) = ready.pop_first() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if let Some(d) = in_degree.get_mut(kid) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(kid.clone());
                    }
                }
            }
        }
        if let Some(t) = by_name.remove(&current) {
            ordered.push(t);
        }
    }

    if !by_name.is_empty() {
        tracing::warn!(
            tables = ?by_name.keys().collect::<Vec<_>>(),
            "Circular foreign key references, loading remaining tables in name order"
        );
        ordered.extend(by_name.into_values());
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, rows: u64, bytes: u64, deps: &[&str]) -> TableInfo {
        TableInfo {
            schema: "public".into(),
            name: name.into(),
            rows_estimate: rows,
            bytes_estimate: bytes,
            depends_on: deps.iter().map(|d| format!("public.{}", d)).collect(),
        }
    }

    #[test]
    fn test_small_table_is_single_open_chunk() {
        let chunks = plan_chunks(&table("t", 10, 100, &[]), 1024);
        assert_eq!(chunks, vec![ChunkRange { index: 0, offset: 0, limit: None }]);
    }

    #[test]
    fn test_chunks_cover_estimate() {
        // 100 rows of 10 bytes, 250 byte chunks -> 25 rows per chunk
        let chunks = plan_chunks(&table("t", 100, 1000, &[]), 250);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1].offset, 25);
        assert_eq!(chunks[2].limit, Some(25));
        assert_eq!(chunks[3].offset, 75);
        assert_eq!(chunks[3].limit, None);
    }

    #[test]
    fn test_wide_rows_get_one_row_per_chunk() {
        let chunks = plan_chunks(&table("blobs", 3, 3000, &[]), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().take(2).all(|c| c.limit == Some(1)));
    }

    #[test]
    fn test_parents_before_children() {
        let tables = vec![
            table("order_items", 0, 0, &["orders", "products"]),
            table("orders", 0, 0, &["customers"]),
            table("products", 0, 0, &[]),
            table("customers", 0, 0, &[]),
        ];
        let names: Vec<String> = dependency_order(tables).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["customers", "orders", "products", "order_items"]);
    }

    #[test]
    fn test_cycles_and_self_references_still_dispatch_everything() {
        let tables = vec![
            table("a", 0, 0, &["b"]),
            table("b", 0, 0, &["a"]),
            table("employees", 0, 0, &["employees"]),
            table("z", 0, 0, &["missing"]),
        ];
        let names: Vec<String> = dependency_order(tables).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["employees", "z", "a", "b"]);
    }
}
