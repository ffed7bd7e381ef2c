//! Schema fingerprints
//!
//! Column-level fingerprints let a session confirm that the tables it
//! created on the target match the source before any rows are loaded.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How many differences are spelled out in an error or warning
pub const MAX_LISTED_DIFFERENCES: usize = 10;

/// One column as the catalog describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            not_null: false,
            default: None,
        }
    }

    fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.name,
            self.data_type,
            if self.not_null { "NO" } else { "YES" },
            self.default.as_deref().unwrap_or("")
        )
    }
}

/// Hash of a table's column definitions, in ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFingerprint {
    pub schema: String,
    pub name: String,
    pub fingerprint: String,
    pub column_count: usize,
}

impl TableFingerprint {
    pub fn new(schema: &str, name: &str, columns: &[ColumnDef]) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        for column in columns {
            hasher.update(column.canonical().as_bytes());
            hasher.update(b"\n");
        }
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            fingerprint: format!("{:08x}", hasher.finalize()),
            column_count: columns.len(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    Match,
    Mismatch,
    SourceOnly,
    TargetOnly,
}

impl fmt::Display for ComparisonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonStatus::Match => write!(f, "match"),
            ComparisonStatus::Mismatch => write!(f, "mismatch"),
            ComparisonStatus::SourceOnly => write!(f, "source only"),
            ComparisonStatus::TargetOnly => write!(f, "target only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableComparison {
    pub table: String,
    pub status: ComparisonStatus,
    pub source_fingerprint: Option<String>,
    pub target_fingerprint: Option<String>,
}

/// Per-table outcome of comparing two fingerprint sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaComparison {
    pub tables: Vec<TableComparison>,
}

impl SchemaComparison {
    pub fn count(&self, status: ComparisonStatus) -> usize {
        self.tables.iter().filter(|t| t.status == status).count()
    }

    pub fn differences(&self) -> impl Iterator<Item = &TableComparison> {
        self.tables.iter().filter(|t| t.status != ComparisonStatus::Match)
    }

    pub fn has_differences(&self) -> bool {
        self.differences().next().is_some()
    }

    pub fn summary(&self) -> String {
        format!(
            "match={}, mismatch={}, source_only={}, target_only={}",
            self.count(ComparisonStatus::Match),
            self.count(ComparisonStatus::Mismatch),
            self.count(ComparisonStatus::SourceOnly),
            self.count(ComparisonStatus::TargetOnly),
        )
    }

    /// Differences as one line, at most `limit` of them by name
    pub fn describe(&self, limit: usize) -> String {
        let total = self.differences().count();
        let mut listed: Vec<String> = self
            .differences()
            .take(limit)
            .map(|t| format!("{} ({})", t.table, t.status))
            .collect();
        if total > limit {
            listed.push(format!("and {} more", total - limit));
        }
        format!("{} difference(s): {}", total, listed.join(", "))
    }
}

/// Compare source and target fingerprints table by table
pub fn compare(source: &[TableFingerprint], target: &[TableFingerprint]) -> SchemaComparison {
    let mut merged: BTreeMap<String, (Option<&str>, Option<&str>)> = BTreeMap::new();
    for fp in source {
        merged.entry(fp.qualified_name()).or_default().0 = Some(&fp.fingerprint);
    }
    for fp in target {
        merged.entry(fp.qualified_name()).or_default().1 = Some(&fp.fingerprint);
    }

    let tables = merged
        .into_iter()
        .map(|(table, (source, target))| {
            let status = match (source, target) {
                (Some(s), Some(t)) if s == t => ComparisonStatus::Match,
                (Some(_), Some(_)) => ComparisonStatus::Mismatch,
                (Some(_), None) => ComparisonStatus::SourceOnly,
                _ => ComparisonStatus::TargetOnly,
            };
            TableComparison {
                table,
                status,
                source_fingerprint: source.map(str::to_string),
                target_fingerprint: target.map(str::to_string),
            }
        })
        .collect();
    SchemaComparison { tables }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders(columns: &[ColumnDef]) -> TableFingerprint {
        TableFingerprint::new("public", "orders", columns)
    }

    #[test]
    fn test_fingerprint_tracks_column_definitions() {
        let base = vec![ColumnDef::new("id", "bigint"), ColumnDef::new("total", "numeric")];
        assert_eq!(orders(&base), orders(&base.clone()));
        assert_eq!(orders(&base).column_count, 2);

        let mut retyped = base.clone();
        retyped[1].data_type = "double precision".into();
        assert_ne!(orders(&base).fingerprint, orders(&retyped).fingerprint);

        let mut not_null = base.clone();
        not_null[0].not_null = true;
        assert_ne!(orders(&base).fingerprint, orders(&not_null).fingerprint);

        let reordered = vec![base[1].clone(), base[0].clone()];
        assert_ne!(orders(&base).fingerprint, orders(&reordered).fingerprint);
    }

    #[test]
    fn test_compare_classifies_each_table() {
        let cols = vec![ColumnDef::new("id", "bigint")];
        let wide = vec![ColumnDef::new("id", "bigint"), ColumnDef::new("note", "text")];
        let source = vec![
            TableFingerprint::new("public", "customers", &cols),
            TableFingerprint::new("public", "orders", &cols),
            TableFingerprint::new("public", "audit", &cols),
        ];
        let target = vec![
            TableFingerprint::new("public", "customers", &cols),
            TableFingerprint::new("public", "orders", &wide),
            TableFingerprint::new("public", "scratch", &cols),
        ];

        let result = compare(&source, &target);
        assert!(result.has_differences());
        assert_eq!(result.summary(), "match=1, mismatch=1, source_only=1, target_only=1");
        let orders = result.tables.iter().find(|t| t.table == "public.orders").unwrap();
        assert_eq!(orders.status, ComparisonStatus::Mismatch);
        assert_ne!(orders.source_fingerprint, orders.target_fingerprint);
    }

    #[test]
    fn test_identical_sets_have_no_differences() {
        let cols = vec![ColumnDef::new("id", "bigint")];
        let fps = vec![TableFingerprint::new("public", "orders", &cols)];
        let result = compare(&fps, &fps);
        assert!(!result.has_differences());
        assert_eq!(result.count(ComparisonStatus::Match), 1);
    }

    #[test]
    fn test_describe_caps_listed_tables() {
        let cols = vec![ColumnDef::new("id", "bigint")];
        let source: Vec<TableFingerprint> = (0..4)
            .map(|i| TableFingerprint::new("public", &format!("t{}", i), &cols))
            .collect();
        let text = compare(&source, &[]).describe(2);
        assert_eq!(
            text,
            "4 difference(s): public.t0 (source only), public.t1 (source only), and 2 more"
        );
    }
}
