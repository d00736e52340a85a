//! Production backend over the blocking Postgres client
//!
//! Queries run through `simple_query`, i.e. the text protocol: every
//! column value arrives as a string, which is exactly the service's
//! lossy text-only row model. NULL is rendered as an empty string.

use std::time::Duration;

use postgres::{Client, NoTls, SimpleQueryMessage};

use crate::backend::{Connection, Connector, Row};
use crate::config::AppConfig;
use crate::error::{Result, ServerError};

/// Validity probe timeout. Probes run on acquire/release/sweep and
/// must not hang the pool behind a dead network path.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PgConnector {
    params: String,
}

impl PgConnector {
    /// `host` may carry a port as `host:port`; default is 5432.
    pub fn new(host: &str, user: &str, password: &str, dbname: &str) -> Self {
        let (host, port) = match host.split_once(':') {
            Some((h, p)) => (h, p),
            None => (host, "5432"),
        };
        Self {
            params: format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, dbname
            ),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.db_host,
            &config.db_username,
            &config.db_password,
            &config.db_database_name,
        )
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let client = Client::connect(&self.params, NoTls)
            .map_err(|e| ServerError::Connect(e.to_string()))?;
        Ok(Box::new(PgConnection { client }))
    }
}

struct PgConnection {
    client: Client,
}

impl Connection for PgConnection {
    fn is_valid(&mut self) -> bool {
        !self.client.is_closed() && self.client.is_valid(PROBE_TIMEOUT).is_ok()
    }

    fn execute(&mut self, sql: &str) -> Result<Vec<Row>> {
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|e| ServerError::Query(e.to_string()))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut out = Row::new();
                for (index, column) in row.columns().iter().enumerate() {
                    out.push(column.name(), row.get(index).unwrap_or_default());
                }
                rows.push(out);
            }
        }
        Ok(rows)
    }
}
