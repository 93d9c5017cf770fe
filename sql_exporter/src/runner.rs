//! Run one configured query per tick and publish its rows.
//!
//! ## Metrics
//!
//! `sql_exporter_query_runs_total`: Total executions of the query
//! `sql_exporter_query_failures_total`: Executions that failed or timed out
//! `sql_exporter_query_points`: Points published by the last execution
//! `sql_exporter_query_duration_seconds`: Wall time of the last execution
//!
//! Every metric carries a `query` label with the query name.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{
    gauge::GaugeStore,
    row::{Row, map_rows},
    scheduler::{Job, JobError},
    source::{self, Source},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`QueryRunner`]
pub enum Error {
    /// See [`crate::source::Error`] for details.
    #[error(transparent)]
    Source(#[from] source::Error),
    /// The query did not complete within its timeout.
    #[error("Query did not complete within {0:?}")]
    Timeout(Duration),
    /// The configured interval is zero, negative, too large or not a number.
    #[error("Query {0} has an invalid interval")]
    InvalidInterval(String),
    /// The configured timeout is zero, negative, too large or not a number.
    #[error("Query {0} has an invalid timeout")]
    InvalidTimeout(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for one [`QueryRunner`]
pub struct Config {
    /// Query name, the prefix of every metric this query exports
    pub name: String,
    /// Seconds between executions
    pub interval_seconds: f64,
    /// Statement passed verbatim to the data source
    pub statement: String,
    /// Columns holding gauge values, every other column is a label
    pub value_columns: Vec<String>,
    /// Seconds after which an execution counts as failed, unbounded if unset
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

/// Longest accepted interval or timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn positive_seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero() && *d <= MAX_DURATION)
}

impl Config {
    /// The execution interval, `None` if `interval_seconds` is not a positive
    /// number no greater than [`MAX_DURATION`].
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        positive_seconds(self.interval_seconds)
    }

    /// The execution timeout. The outer `None` means `timeout_seconds` is set
    /// but not a positive number no greater than [`MAX_DURATION`].
    #[must_use]
    pub fn timeout(&self) -> Option<Option<Duration>> {
        match self.timeout_seconds {
            None => Some(None),
            Some(secs) => positive_seconds(secs).map(Some),
        }
    }

    /// Every metric name this query can export.
    #[must_use]
    pub fn metric_names(&self) -> Vec<String> {
        self.value_columns
            .iter()
            .map(|column| format!("{}_{column}", self.name))
            .collect()
    }
}

/// Executes one query against its [`Source`] and reconciles the result into
/// the shared [`GaugeStore`].
#[derive(Debug)]
pub struct QueryRunner<S> {
    name: String,
    statement: String,
    value_columns: Vec<String>,
    metric_names: Vec<String>,
    interval: Duration,
    timeout: Option<Duration>,
    source: S,
    store: Arc<GaugeStore>,
    metric_labels: Vec<(String, String)>,
}

impl<S> QueryRunner<S>
where
    S: Source,
{
    /// Create a new [`QueryRunner`] instance
    ///
    /// # Errors
    ///
    /// Function will return an error if the configured interval or timeout is
    /// not a positive number of seconds no greater than [`MAX_DURATION`].
    pub fn new(config: Config, source: S, store: Arc<GaugeStore>) -> Result<Self, Error> {
        let interval = config
            .interval()
            .ok_or_else(|| Error::InvalidInterval(config.name.clone()))?;
        let timeout = config
            .timeout()
            .ok_or_else(|| Error::InvalidTimeout(config.name.clone()))?;
        let metric_names = config.metric_names();
        let metric_labels = vec![("query".to_string(), config.name.clone())];

        Ok(Self {
            name: config.name,
            statement: config.statement,
            value_columns: config.value_columns,
            metric_names,
            interval,
            timeout,
            source,
            store,
            metric_labels,
        })
    }

    /// Time between executions.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&mut self) -> Result<Vec<Row>, Error> {
        let Some(limit) = self.timeout else {
            return Ok(self.source.fetch(&self.statement).await?);
        };
        let res = tokio::time::timeout(limit, self.source.fetch(&self.statement)).await;
        match res {
            Ok(rows) => Ok(rows?),
            Err(_) => {
                // The abandoned statement may still occupy the connection.
                self.source.reset();
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Execute the query once and publish the result.
    ///
    /// A failed execution is logged and publishes nothing, which removes every
    /// series this query exported before.
    pub async fn run_once(&mut self) {
        let started = Instant::now();
        counter!("sql_exporter_query_runs_total", &self.metric_labels).increment(1);

        let points = match self.execute().await {
            Ok(rows) => map_rows(&rows, &self.value_columns, &self.name),
            Err(err) => {
                error!(
                    "Error while querying [{}], query [{}]: {err}",
                    self.name, self.statement
                );
                counter!("sql_exporter_query_failures_total", &self.metric_labels).increment(1);
                Vec::new()
            }
        };
        debug!("query {} produced {} points", self.name, points.len());

        self.store.reconcile(&self.metric_names, &points);

        gauge!("sql_exporter_query_points", &self.metric_labels).set(points.len() as f64);
        gauge!("sql_exporter_query_duration_seconds", &self.metric_labels)
            .set(started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl<S> Job for QueryRunner<S>
where
    S: Source,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn tick(&mut self) -> Result<(), JobError> {
        self.run_once().await;
        Ok(())
    }
}
