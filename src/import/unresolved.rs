// catalogtool/src/import/unresolved.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::JobId;

/// Rows of one job that could not be linked to their parent, grouped by
/// `<table>.<relation>` category.
pub type UnresolvedRows = BTreeMap<String, Vec<Value>>;

/// Holding area for rows waiting on a missing parent. Unbounded: operators are
/// expected to export and clear promptly.
#[async_trait]
pub trait UnresolvedRowStore: Send + Sync {
    async fn add(&self, job_id: JobId, category: &str, row: Value);

    /// Empty when the job has no unresolved rows.
    async fn get(&self, job_id: JobId) -> UnresolvedRows;

    async fn clear(&self, job_id: JobId);
}

#[derive(Debug, Default)]
pub struct InMemoryUnresolvedRowStore {
    rows: DashMap<JobId, UnresolvedRows>,
}

impl InMemoryUnresolvedRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnresolvedRowStore for InMemoryUnresolvedRowStore {
    async fn add(&self, job_id: JobId, category: &str, row: Value) {
        self.rows
            .entry(job_id)
            .or_default()
            .entry(category.to_string())
            .or_default()
            .push(row);
    }

    async fn get(&self, job_id: JobId) -> UnresolvedRows {
        self.rows
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    async fn clear(&self, job_id: JobId) {
        self.rows.remove(&job_id);
    }
}

/// Downloadable document of a job's unresolved rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedExport {
    pub job_id: JobId,
    pub generated_at: DateTime<Utc>,
    pub total_rows: usize,
    pub categories: UnresolvedRows,
}

impl UnresolvedExport {
    pub fn new(job_id: JobId, categories: UnresolvedRows) -> Self {
        Self {
            job_id,
            generated_at: Utc::now(),
            total_rows: categories.values().map(Vec::len).sum(),
            categories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_rows_are_grouped_per_job_and_category() {
        let store = InMemoryUnresolvedRowStore::new();
        let job = JobId::new();
        let other = JobId::new();

        store.add(job, "quotes.author", json!({ "text": "a", "author": "Nobody" })).await;
        store.add(job, "quotes.author", json!({ "text": "b", "author": "Nobody" })).await;
        store.add(job, "likes.quote", json!({ "quote_id": 99, "user_id": "u1" })).await;
        store.add(other, "views.quote", json!({ "quote_id": 1 })).await;

        let rows = store.get(job).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["quotes.author"].len(), 2);
        assert_eq!(rows["quotes.author"][1]["text"], json!("b"));

        store.clear(job).await;
        assert!(store.get(job).await.is_empty());
        assert_eq!(store.get(other).await.len(), 1);
    }

    #[test]
    fn test_export_counts_rows() {
        let mut categories = UnresolvedRows::new();
        categories.insert("quotes.author".to_string(), vec![json!({}), json!({})]);
        categories.insert("quote_tags.quote".to_string(), vec![json!({})]);

        let export = UnresolvedExport::new(JobId::new(), categories);
        assert_eq!(export.total_rows, 3);
        let document = serde_json::to_value(&export).unwrap();
        assert_eq!(document["categories"]["quote_tags.quote"].as_array().map(Vec::len), Some(1));
    }
}
