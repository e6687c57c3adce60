// ABOUTME: RowStreamExecutor - runs the bound statement through a server-side portal
// ABOUTME: Fetches fetch_size rows per round trip so memory stays bounded for large results

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Portal, Transaction};

use super::binder::BoundQuery;
use super::convert::pg_row_to_row;
use super::Row;
use crate::error::SourceError;
use crate::utils::{retry_with_backoff, sanitize_url};

/// Lazy, finite, non-restartable sequence of rows for one execution.
pub type RowStream<'a> = BoxStream<'a, Result<Row, SourceError>>;

/// Executes bound statements against the source.
///
/// The stream borrows the source mutably, so a second execution cannot start
/// while rows of the first are still being consumed.
#[async_trait]
pub trait RowSource: Send {
    async fn execute<'a>(&'a mut self, query: &BoundQuery) -> Result<RowStream<'a>, SourceError>;
}

/// Settings for the PostgreSQL source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Rows requested from the portal per round trip
    pub fetch_size: usize,
    /// Lowercase column names in emitted rows
    pub lowercase_column_names: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            fetch_size: 10_000, // bounds memory while keeping round trips few
            lowercase_column_names: true,
        }
    }
}

/// PostgreSQL source streaming rows through a portal in a read-only transaction.
///
/// When built with `connect`, a closed connection is re-established at the
/// start of the next execution.
pub struct PostgresSource {
    client: Client,
    options: SourceOptions,
    connection: JoinHandle<()>,
    url: Option<String>,
}

impl PostgresSource {
    /// Wrap an already connected client. It is not reconnected if it closes.
    pub fn new(client: Client, connection: JoinHandle<()>, options: SourceOptions) -> Self {
        Self {
            client,
            options,
            connection,
            url: None,
        }
    }

    /// Connect with TLS negotiation and a few retries.
    pub async fn connect(url: &str, options: SourceOptions) -> Result<Self> {
        let (client, connection) = connect_with_retry(url).await?;
        let mut source = Self::new(client, connection, options);
        source.url = Some(url.to_string());
        Ok(source)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Replace a closed client with a fresh connection.
    async fn ensure_connected(&mut self) -> Result<(), SourceError> {
        if !self.client.is_closed() {
            return Ok(());
        }
        let Some(url) = &self.url else {
            return Err(SourceError::new("source connection is closed"));
        };

        tracing::warn!(
            "Source connection to {} was closed, reconnecting",
            sanitize_url(url)
        );
        let (client, connection) = connect_with_retry(url)
            .await
            .map_err(|e| SourceError::new(format!("failed to reconnect to source: {:#}", e)))?;
        self.connection.abort();
        self.client = client;
        self.connection = connection;
        tracing::info!("Reconnected to source");
        Ok(())
    }
}

impl Drop for PostgresSource {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

struct PortalState<'a> {
    transaction: Transaction<'a>,
    portal: Portal,
    buffer: VecDeque<tokio_postgres::Row>,
    exhausted: bool,
    fetch_size: i32,
    lowercase: bool,
}

#[async_trait]
impl RowSource for PostgresSource {
    async fn execute<'a>(&'a mut self, query: &BoundQuery) -> Result<RowStream<'a>, SourceError> {
        self.ensure_connected().await?;

        let fetch_size = i32::try_from(self.options.fetch_size.max(1)).unwrap_or(i32::MAX);
        let lowercase = self.options.lowercase_column_names;

        let transaction = self
            .client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|e| SourceError::postgres("failed to start read-only transaction", e))?;

        let statement = transaction
            .prepare_typed(query.sql(), &query.types())
            .await
            .map_err(|e| SourceError::postgres("failed to prepare statement", e))?;

        let values = query.values();
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let portal = transaction
            .bind(&statement, &params)
            .await
            .map_err(|e| SourceError::postgres("failed to bind statement parameters", e))?;

        tracing::debug!(
            "Opened portal with watermark {} (fetch size {})",
            query.watermark(),
            fetch_size
        );

        let state = PortalState {
            transaction,
            portal,
            buffer: VecDeque::new(),
            exhausted: false,
            fetch_size,
            lowercase,
        };

        let rows = stream::try_unfold(state, |mut state| async move {
            if state.buffer.is_empty() && !state.exhausted {
                let batch = state
                    .transaction
                    .query_portal(&state.portal, state.fetch_size)
                    .await
                    .map_err(|e| SourceError::postgres("failed to fetch rows", e))?;
                if batch.len() < state.fetch_size as usize {
                    state.exhausted = true;
                }
                state.buffer.extend(batch);
            }

            match state.buffer.pop_front() {
                Some(row) => {
                    let converted = pg_row_to_row(&row, state.lowercase);
                    Ok(Some((converted, state)))
                }
                None => {
                    let PortalState {
                        transaction,
                        portal,
                        ..
                    } = state;
                    drop(portal);
                    transaction
                        .commit()
                        .await
                        .map_err(|e| SourceError::postgres("failed to close transaction", e))?;
                    Ok(None)
                }
            }
        });

        Ok(rows.boxed())
    }
}

/// Connect to PostgreSQL, spawning the connection driver task.
///
/// TLS is negotiated when the server offers it (`sslmode` in the URL is
/// honoured by tokio-postgres).
pub async fn connect(url: &str) -> Result<(Client, JoinHandle<()>)> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = postgres_native_tls::MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .context("Failed to connect to source database")?;

    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Source connection error: {}", e);
        }
    });

    Ok((client, handle))
}

/// Connect with up to three attempts and exponential backoff.
pub async fn connect_with_retry(url: &str) -> Result<(Client, JoinHandle<()>)> {
    retry_with_backoff(|| connect(url), 2, Duration::from_secs(1))
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))
}
