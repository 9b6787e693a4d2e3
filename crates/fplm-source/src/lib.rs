//! Remote table reader for the season mirror.
//!
//! Speaks the PostgREST dialect of the hosted database: one `GET` per page
//! with `offset`/`limit`, plus `gte.` and `in.(...)` column filters for
//! incremental and inclusion-set fetches. Everything is funneled through the
//! [`TableSource`] trait so the pipeline can run against a canned source in
//! tests.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fplm_core::{check_schema, Row, SourceTable, TableData};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "fplm-source";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_IN_CHUNK_SIZE: usize = 500;

/// Row-fetch predicate. `Gte` is the incremental lower bound on a period
/// column; `In` is the inclusion-set fetch, chunked by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Gte { column: String, value: i64 },
    In { column: String, values: Vec<String> },
}

impl Filter {
    pub fn gte(column: &str, value: i64) -> Self {
        Filter::Gte {
            column: column.to_string(),
            value,
        }
    }

    pub fn within(column: &str, values: Vec<String>) -> Self {
        Filter::In {
            column: column.to_string(),
            values,
        }
    }
}

/// Fatal per-table failure. Not retried within a run; the caller decides
/// whether the table was essential.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to '{table}' failed: {source}")]
    Transport {
        table: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("source returned http {status} for '{table}' at {url}")]
    HttpStatus {
        table: &'static str,
        status: u16,
        url: String,
    },
    #[error("decoding rows from '{table}': {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Schema(#[from] fplm_core::SchemaError),
}

/// A complete in-memory fetch of one named remote table.
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn fetch(&self, table: SourceTable, filter: &Filter) -> Result<TableData, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub batch_size: usize,
    pub in_chunk_size: usize,
    pub timeout: Duration,
}

impl SourceClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            in_chunk_size: DEFAULT_IN_CHUNK_SIZE,
            timeout: Duration::from_secs(20),
        }
    }
}

/// PostgREST-backed [`TableSource`].
#[derive(Debug)]
pub struct RestSource {
    client: reqwest::Client,
    config: SourceClientConfig,
}

impl RestSource {
    pub fn new(config: SourceClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn table_url(&self, table: SourceTable) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table.remote_name()
        )
    }

    async fn fetch_page(
        &self,
        table: SourceTable,
        filter: &Filter,
        offset: usize,
    ) -> Result<Vec<Row>, SourceError> {
        let url = self.table_url(table);
        let mut query = vec![
            ("select".to_string(), "*".to_string()),
            ("offset".to_string(), offset.to_string()),
            ("limit".to_string(), self.config.batch_size.to_string()),
        ];
        query.extend(filter_params(filter));

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .query(&query)
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                table: table.remote_name(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                table: table.remote_name(),
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        response
            .json::<Vec<Row>>()
            .await
            .map_err(|source| SourceError::Decode {
                table: table.remote_name(),
                source,
            })
    }

    /// Pages through one filtered select until a short page, concatenating in
    /// page order.
    async fn fetch_all_pages(
        &self,
        table: SourceTable,
        filter: &Filter,
    ) -> Result<Vec<Row>, SourceError> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch_page(table, filter, offset).await?;
            let got = page.len();
            rows.extend(page);
            if got < self.config.batch_size {
                break;
            }
            offset += self.config.batch_size;
        }
        Ok(rows)
    }
}

#[async_trait]
impl TableSource for RestSource {
    async fn fetch(&self, table: SourceTable, filter: &Filter) -> Result<TableData, SourceError> {
        let rows = match filter {
            Filter::In { column, values } => {
                let mut rows = Vec::new();
                for chunk in chunk_values(values, self.config.in_chunk_size) {
                    let chunk_filter = Filter::In {
                        column: column.clone(),
                        values: chunk.to_vec(),
                    };
                    rows.extend(self.fetch_all_pages(table, &chunk_filter).await?);
                }
                rows
            }
            _ => self.fetch_all_pages(table, filter).await?,
        };

        let data = TableData::from_rows(rows);
        check_schema(table, &data)?;
        info!(table = table.remote_name(), rows = data.len(), "fetched table");
        Ok(data)
    }
}

fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::All => Vec::new(),
        Filter::Gte { column, value } => vec![(column.clone(), format!("gte.{value}"))],
        Filter::In { column, values } => {
            vec![(column.clone(), format!("in.({})", values.join(",")))]
        }
    }
}

fn chunk_values(values: &[String], chunk_size: usize) -> impl Iterator<Item = &[String]> {
    values.chunks(chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gte_filter_renders_postgrest_operator() {
        let params = filter_params(&Filter::gte("gw", 14));
        assert_eq!(params, vec![("gw".to_string(), "gte.14".to_string())]);
    }

    #[test]
    fn in_filter_renders_parenthesized_list() {
        let filter = Filter::within(
            "match_id",
            vec!["prem-a".to_string(), "prem-b".to_string()],
        );
        let params = filter_params(&filter);
        assert_eq!(
            params,
            vec![("match_id".to_string(), "in.(prem-a,prem-b)".to_string())]
        );
    }

    #[test]
    fn all_filter_adds_no_params() {
        assert!(filter_params(&Filter::All).is_empty());
    }

    #[test]
    fn inclusion_sets_are_chunked_to_the_configured_size() {
        let values: Vec<String> = (0..1203).map(|i| format!("m{i}")).collect();
        let chunks: Vec<usize> = chunk_values(&values, 500).map(|c| c.len()).collect();
        assert_eq!(chunks, vec![500, 500, 203]);
    }
}
