//! PostgreSQL implementation of the connection traits, backed by sqlx.

use crate::config::{KeepaliveSettings, redact_url};
use crate::db::connection::{Connection, Connector, FetchMode, QueryOutput, QueryParam};
use crate::db::keepalive::apply_keepalive;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use futures_util::TryStreamExt;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use std::str::FromStr;
use tracing::debug;

/// Opens physical PostgreSQL connections with keepalive settings applied.
///
/// The URL is parsed once. A malformed URL does not fail construction; every
/// `connect()` reports it as [`DbError::Configuration`] instead, so boot-time
/// readiness checks count it like any other failed attempt.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: Result<PgConnectOptions, String>,
    target: String,
}

impl PgConnector {
    pub fn new(database_url: &str, keepalive: &KeepaliveSettings) -> Self {
        let options = PgConnectOptions::from_str(database_url)
            .map(|options| apply_keepalive(options, keepalive))
            .map_err(|e| format!("Invalid database URL: {e}"));

        Self {
            options,
            target: redact_url(database_url),
        }
    }

    /// Parsed connect options, or the configuration error.
    pub fn connect_options(&self) -> DbResult<&PgConnectOptions> {
        self.options
            .as_ref()
            .map_err(|message| DbError::configuration(message.clone()))
    }
}

impl Connector for PgConnector {
    type Connection = PgSession;

    async fn connect(&self) -> DbResult<PgSession> {
        let options = self.connect_options()?;
        let conn = options.connect().await?;
        debug!(target_db = %self.target, "Connected to PostgreSQL");
        Ok(PgSession { conn })
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// One physical PostgreSQL session.
#[derive(Debug)]
pub struct PgSession {
    conn: PgConnection,
}

impl PgSession {
    pub fn into_inner(self) -> PgConnection {
        self.conn
    }
}

impl Connection for PgSession {
    async fn ping(&mut self) -> DbResult<()> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql("SELECT 1")).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        // Outside a transaction the server only warns.
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }

    async fn run(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        fetch: FetchMode,
    ) -> DbResult<QueryOutput> {
        let mut query = sqlx::query(statement);
        for param in params {
            query = bind_param(query, param);
        }

        let output = match fetch {
            FetchMode::All => {
                let rows: Vec<PgRow> = query.fetch(&mut self.conn).try_collect().await?;
                QueryOutput::Rows(rows.iter().map(RowToJson::to_json_map).collect())
            }
            FetchMode::One => {
                let row = query.fetch_one(&mut self.conn).await?;
                QueryOutput::Row(Some(row.to_json_map()))
            }
            FetchMode::Optional => {
                let row = query.fetch_optional(&mut self.conn).await?;
                QueryOutput::Row(row.map(|r| r.to_json_map()))
            }
            FetchMode::Scalar => {
                let row = query.fetch_optional(&mut self.conn).await?;
                QueryOutput::Scalar(row.and_then(|r| r.first_value()))
            }
            FetchMode::None => {
                let result = query.execute(&mut self.conn).await?;
                QueryOutput::Affected(result.rows_affected())
            }
        };
        Ok(output)
    }

    async fn close(self) -> DbResult<()> {
        sqlx::Connection::close(self.conn).await?;
        Ok(())
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}
