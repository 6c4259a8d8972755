use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ApiSettings;
use crate::error::{FetchError, RowError};
use crate::regions::Region;
use crate::schema::{SchemaMapping, PLACE_COLUMN, STATE_COLUMN};

const USER_AGENT: &str = "places-acs-builder/1.0";

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// One GET against the statistical API. Swapped out in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, FetchError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Validated API response for one region: header plus well-formed data rows.
#[derive(Debug, Clone, Default)]
pub struct FetchedTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows dropped because their column count differs from the header.
    pub malformed_rows: Vec<RowError>,
}

impl FetchedTable {
    pub fn column_index(&self) -> HashMap<&str, usize> {
        self.header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect()
    }

    pub fn rows_received(&self) -> usize {
        self.rows.len() + self.malformed_rows.len()
    }
}

pub struct CensusClient {
    transport: Arc<dyn Transport>,
    settings: ApiSettings,
}

impl CensusClient {
    pub fn new(transport: Arc<dyn Transport>, settings: ApiSettings) -> Self {
        CensusClient { transport, settings }
    }

    pub fn with_reqwest(settings: ApiSettings) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(settings.timeout)?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    /// All declared variables for every place in `region`.
    pub async fn fetch(
        &self,
        region: &Region,
        schema: &SchemaMapping,
    ) -> Result<FetchedTable, FetchError> {
        let query = self.query(vec![
            ("get".into(), schema.get_param()),
            ("for".into(), self.settings.geography.clone()),
            ("in".into(), format!("state:{}", region.code())),
        ]);

        let body = self.get_with_retry(&query, region.code()).await?;
        let table = parse_table(&body)?;
        if table.header.is_empty() {
            return Ok(table);
        }

        let mut required = vec![STATE_COLUMN, PLACE_COLUMN];
        required.extend(schema.variables().iter().map(|v| v.external_code.as_str()));
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|col| !table.header.iter().any(|h| h == col))
            .collect();
        if !missing.is_empty() {
            return Err(FetchError::MalformedResponse(format!(
                "header is missing columns: {}",
                missing.join(", ")
            )));
        }

        Ok(table)
    }

    /// Ask the API which states it currently serves.
    pub async fn discover_regions(&self) -> Result<Vec<String>, FetchError> {
        let query = self.query(vec![
            ("get".into(), "NAME".into()),
            ("for".into(), "state:*".into()),
        ]);
        let body = self.get_with_retry(&query, "state:*").await?;
        let table = parse_table(&body)?;
        let idx = table
            .header
            .iter()
            .position(|h| h == STATE_COLUMN)
            .ok_or_else(|| FetchError::MalformedResponse("no `state` column".into()))?;

        let mut codes: Vec<String> = table
            .rows
            .iter()
            .filter_map(|r| r.get(idx).cloned().flatten())
            .map(|c| format!("{:0>2}", c.trim()))
            .collect();
        codes.sort();
        codes.dedup();
        info!("API serves {} states", codes.len());
        Ok(codes)
    }

    fn query(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        if let Some(key) = &self.settings.api_key {
            params.push(("key".into(), key.clone()));
        }
        params
    }

    async fn get_with_retry(&self, query: &[(String, String)], label: &str) -> Result<String, FetchError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match self.transport.get(&self.settings.base_url, query).await {
                Ok(reply) => match classify(reply) {
                    Ok(body) => return Ok(body),
                    Err(e) => e,
                },
                Err(e) => e,
            };
            attempt += 1;

            if !err.is_transient() {
                warn!("{}: giving up on non-retryable error: {}", label, err);
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!("{}: {} attempts failed, last error: {}", label, attempt, err);
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.settings.base_delay * 2u32.pow(attempt - 1);
            warn!(
                "{}: {} (attempt {}/{}), backing off {:.1}s",
                label,
                err,
                attempt,
                max_attempts,
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

fn classify(reply: HttpReply) -> Result<String, FetchError> {
    match reply.status {
        200..=299 => Ok(reply.body),
        429 => Err(FetchError::RateLimited),
        500..=599 => Err(FetchError::Server {
            status: reply.status,
        }),
        status => Err(FetchError::Http {
            status,
            body: reply.body.chars().take(200).collect(),
        }),
    }
}

/// Parse a `[[header...], [row...], ...]` body. Empty body (HTTP 204) means no rows.
pub fn parse_table(body: &str) -> Result<FetchedTable, FetchError> {
    if body.trim().is_empty() {
        debug!("empty response body, treating as no rows");
        return Ok(FetchedTable::default());
    }

    let raw: Vec<Vec<Option<String>>> = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("not a 2D string array: {e}")))?;

    let mut iter = raw.into_iter();
    let header: Vec<String> = match iter.next() {
        Some(h) => h
            .into_iter()
            .map(|c| c.unwrap_or_default())
            .collect(),
        None => return Ok(FetchedTable::default()),
    };

    let mut rows = Vec::new();
    let mut malformed_rows = Vec::new();
    for row in iter {
        if row.len() == header.len() {
            rows.push(row);
        } else {
            malformed_rows.push(RowError::ColumnCount {
                expected: header.len(),
                got: row.len(),
            });
        }
    }

    Ok(FetchedTable {
        header,
        rows,
        malformed_rows,
    })
}
