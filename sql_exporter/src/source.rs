//! Data sources queried by the exporter.
//!
//! A [`Source`] executes an opaque statement and hands back its rows. The
//! production implementation, [`SqlSource`], holds one persistent native
//! `sqlx` connection. The backend is picked from the connection URL scheme
//! (`postgres://`, `mysql://`, `sqlite:`) and every backend decodes its cells
//! with the full set of column types its driver knows.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use sqlx::{
    Column, ColumnIndex, Connection as _, Decode, Row as _,
    mysql::{MySqlConnection, MySqlRow},
    postgres::{PgConnection, PgRow, types::Oid},
    sqlite::{SqliteConnection, SqliteRow},
    types::{
        Decimal, Uuid,
        chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc},
    },
};
use tracing::{debug, info, warn};

use crate::row::{Row, Value};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Source`] implementations
pub enum Error {
    /// Wrapper for [`sqlx::Error`].
    #[error("Data source error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// The connection URL names no supported backend.
    #[error("Unsupported data source scheme: {0:?}")]
    UnsupportedScheme(String),
}

#[async_trait]
/// Something a query can be executed against.
pub trait Source: Send {
    /// Execute `statement` and return every resulting row.
    ///
    /// # Errors
    ///
    /// Function will return an error if the statement cannot be executed or
    /// its rows cannot be read.
    async fn fetch(&mut self, statement: &str) -> Result<Vec<Row>, Error>;

    /// Discard any in-flight work. Called after a [`Source::fetch`] was
    /// abandoned part way through.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Database backends a [`SqlSource`] can talk to.
pub enum Backend {
    /// `postgres://` or `postgresql://`
    Postgres,
    /// `mysql://` or `mariadb://`
    MySql,
    /// `sqlite:`
    Sqlite,
}

impl Backend {
    /// Pick the backend named by the scheme of `connect_string`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the scheme names no supported
    /// backend.
    pub fn from_connect_string(connect_string: &str) -> Result<Self, Error> {
        let scheme = connect_string
            .split_once(':')
            .map_or("", |(scheme, _)| scheme);
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(Error::UnsupportedScheme(scheme.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }
}

enum Connection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl Connection {
    async fn open(backend: Backend, connect_string: &str) -> Result<Self, sqlx::Error> {
        Ok(match backend {
            Backend::Postgres => Self::Postgres(PgConnection::connect(connect_string).await?),
            Backend::MySql => Self::MySql(MySqlConnection::connect(connect_string).await?),
            Backend::Sqlite => Self::Sqlite(SqliteConnection::connect(connect_string).await?),
        })
    }

    async fn fetch(&mut self, statement: &str) -> Result<Vec<Row>, sqlx::Error> {
        let rows = match self {
            Self::Postgres(conn) => {
                let rows = sqlx::query(statement).fetch_all(conn).await?;
                rows.iter().map(|row| decode_row(row, decode_postgres)).collect()
            }
            Self::MySql(conn) => {
                let rows = sqlx::query(statement).fetch_all(conn).await?;
                rows.iter().map(|row| decode_row(row, decode_mysql)).collect()
            }
            Self::Sqlite(conn) => {
                let rows = sqlx::query(statement).fetch_all(conn).await?;
                rows.iter().map(|row| decode_row(row, decode_sqlite)).collect()
            }
        };
        Ok(rows)
    }
}

/// A [`Source`] backed by a persistent SQL connection.
///
/// If the connection breaks, or a fetch is abandoned, it is dropped and
/// re-established by the next [`Source::fetch`].
pub struct SqlSource {
    backend: Backend,
    connect_string: String,
    connection: Option<Connection>,
}

impl std::fmt::Debug for SqlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The connect string may carry credentials.
        f.debug_struct("SqlSource")
            .field("backend", &self.backend)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl SqlSource {
    /// Open a connection to `connect_string`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the scheme is not supported or the
    /// connection cannot be established.
    pub async fn connect(connect_string: &str) -> Result<Self, Error> {
        let backend = Backend::from_connect_string(connect_string)?;
        let connection = Connection::open(backend, connect_string).await?;
        info!("connected to {} data source", backend.name());
        Ok(Self {
            backend,
            connect_string: connect_string.to_string(),
            connection: Some(connection),
        })
    }

    /// The backend this source talks to.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    async fn connection(&mut self) -> Result<&mut Connection, Error> {
        let connection = if let Some(connection) = self.connection.take() {
            connection
        } else {
            info!("re-establishing {} data source connection", self.backend.name());
            Connection::open(self.backend, &self.connect_string).await?
        };
        Ok(self.connection.insert(connection))
    }
}

#[async_trait]
impl Source for SqlSource {
    async fn fetch(&mut self, statement: &str) -> Result<Vec<Row>, Error> {
        let connection = self.connection().await?;
        match connection.fetch(statement).await {
            Ok(rows) => {
                debug!("fetched {} rows", rows.len());
                Ok(rows)
            }
            Err(err) => {
                if is_connection_error(&err) {
                    warn!("dropping broken data source connection: {err}");
                    self.connection = None;
                }
                Err(err.into())
            }
        }
    }

    fn reset(&mut self) {
        if self.connection.take().is_some() {
            warn!("dropping busy data source connection");
        }
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

fn decode_row<R>(row: &R, decode_cell: fn(&R, usize) -> Value) -> Row
where
    R: sqlx::Row,
{
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_cell(row, column.ordinal())))
        .collect()
}

/// Return the first of the listed types the cell decodes as. A type mismatch
/// is an error from `try_get`, never a panic, and SQL `NULL` decodes as
/// `None` under any of them.
macro_rules! decode_first {
    ($row:expr, $index:expr; $($ty:ty => $into:expr),+ $(,)?) => {
        $(
            if let Ok(v) = $row.try_get::<Option<$ty>, _>($index) {
                return v.map_or(Value::Null, $into);
            }
        )+
    };
}

fn decimal(d: Decimal) -> Value {
    d.to_f64()
        .map_or_else(|| Value::Text(d.to_string()), Value::Float)
}

fn unsigned(v: u64) -> Value {
    i64::try_from(v).map_or(Value::Float(v as f64), Value::Int)
}

fn text<T: ToString>(v: T) -> Value {
    Value::Text(v.to_string())
}

/// Last resort for types no decoder above claims: the raw cell read as UTF-8
/// text, `Null` when it is not valid UTF-8.
fn raw_text<'r, R>(row: &'r R, index: usize) -> Value
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    String: Decode<'r, R::Database>,
{
    match row.try_get_unchecked::<Option<String>, _>(index) {
        Ok(v) => v.map_or(Value::Null, Value::Text),
        Err(err) => {
            debug!("undecodable cell in column {index}: {err}");
            Value::Null
        }
    }
}

fn decode_postgres(row: &PgRow, index: usize) -> Value {
    decode_first!(row, index;
        bool => Value::Bool,
        i8 => |v| Value::Int(i64::from(v)),
        i16 => |v| Value::Int(i64::from(v)),
        i32 => |v| Value::Int(i64::from(v)),
        i64 => Value::Int,
        Oid => |v: Oid| Value::Int(i64::from(v.0)),
        f32 => |v| Value::Float(f64::from(v)),
        f64 => Value::Float,
        Decimal => decimal,
        String => Value::Text,
        Vec<u8> => Value::Bytes,
        NaiveDateTime => text,
        DateTime<Utc> => |v: DateTime<Utc>| Value::Text(v.to_rfc3339()),
        NaiveDate => text,
        NaiveTime => text,
        Uuid => text,
    );
    raw_text(row, index)
}

fn decode_mysql(row: &MySqlRow, index: usize) -> Value {
    decode_first!(row, index;
        i64 => Value::Int,
        u64 => unsigned,
        f64 => Value::Float,
        f32 => |v| Value::Float(f64::from(v)),
        bool => Value::Bool,
        Decimal => decimal,
        String => Value::Text,
        Vec<u8> => Value::Bytes,
        NaiveDateTime => text,
        DateTime<Utc> => |v: DateTime<Utc>| Value::Text(v.to_rfc3339()),
        NaiveDate => text,
        NaiveTime => text,
    );
    raw_text(row, index)
}

fn decode_sqlite(row: &SqliteRow, index: usize) -> Value {
    decode_first!(row, index;
        i64 => Value::Int,
        f64 => Value::Float,
        bool => Value::Bool,
        String => Value::Text,
        Vec<u8> => Value::Bytes,
    );
    raw_text(row, index)
}
