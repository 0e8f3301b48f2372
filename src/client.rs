// src/client.rs
use crate::tables::Table;
use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use std::{collections::BTreeMap, time::Duration};

/// Client for the router's admin API
pub struct AdminClient {
    client: Client,
    base_url: String,
}

impl AdminClient {
    /// Create a new client pointing to the admin listener at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}", self.base_url, table.name())
    }

    /// Every entry of `table`
    pub async fn get_table(&self, table: Table) -> Result<BTreeMap<String, String>> {
        let response = self.client.get(self.table_url(table)).send().await?;
        let response = check(response, table).await?;
        Ok(response.json().await?)
    }

    /// Value stored under `key`, if any
    pub async fn get_entry(&self, table: Table, key: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.table_url(table))
            .query(&[(table.key_field(), key)])
            .send()
            .await?;
        let response = check(response, table).await?;

        let mut entry: BTreeMap<String, String> = response.json().await?;
        Ok(entry.remove(key))
    }

    /// Insert or overwrite `key`
    pub async fn set_entry(&self, table: Table, key: &str, value: &str) -> Result<()> {
        let response = self
            .client
            .post(self.table_url(table))
            .form(&[(table.key_field(), key), (table.value_field(), value)])
            .send()
            .await?;
        check(response, table).await?;
        Ok(())
    }

    /// Remove `key`. Succeeds whether or not it was present.
    pub async fn delete_entry(&self, table: Table, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.table_url(table))
            .query(&[(table.key_field(), key)])
            .send()
            .await?;
        check(response, table).await?;
        Ok(())
    }
}

async fn check(response: Response, table: Table) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    bail!("{} request failed with {}: {}", table, status, body.trim());
}
