use std::io::BufReader;
use std::sync::Arc;

use contention_config::shared::{IntoConnectOptions, PgConnectionConfig, UPDATE_WORKER_OPTIONS};
use pg_escape::quote_identifier;
use rustls::ClientConfig;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, Connection, NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::error::{ContentionError, ContentionResult, ErrorKind};
use crate::store::base::{LockPolicy, Record, RecordConnection, RecordStore, UpdateOutcome};
use crate::{bail, contention_error};

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => debug!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The `Client` terminates the connection when dropped, so the handle is not tracked.
    tokio::spawn(task);
}

/// Tags a failed connection attempt, which carries no SQLSTATE unless the server rejected it.
#[track_caller]
fn connect_error(err: tokio_postgres::Error) -> ContentionError {
    match err.code() {
        Some(_) => err.into(),
        None => contention_error!(
            ErrorKind::SourceConnectionFailed,
            "Failed to connect to PostgreSQL",
            source: err
        ),
    }
}

/// The three statements a worker issues, rendered once for the configured table.
///
/// Reads return the row's `ctid` so that the conditional update targets only the row that was
/// read, whatever the other rows of the table hold. A concurrent update gives the row a new
/// `ctid`, which makes the update match zero rows just like a version change does.
#[derive(Debug)]
struct RecordStatements {
    select: String,
    select_for_update: String,
    conditional_update: String,
}

impl RecordStatements {
    fn new(table: &str) -> Self {
        let table = quote_identifier(table);

        Self {
            select: format!(
                "select version::bigint, content::text, ctid::text from {table} limit 1"
            ),
            select_for_update: format!(
                "select version::bigint, content::text, ctid::text from {table} \
                 limit 1 for update"
            ),
            conditional_update: format!(
                "update {table} set content = $1, version = $2::bigint \
                 where version = $3::bigint and ctid = $4::text::tid returning version::bigint"
            ),
        }
    }

    fn select(&self, policy: LockPolicy) -> &str {
        if policy.locks_row() {
            &self.select_for_update
        } else {
            &self.select
        }
    }
}

/// Record store backed by a Postgres table with `version` and `content` columns.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    config: PgConnectionConfig,
    statements: Arc<RecordStatements>,
}

impl PostgresRecordStore {
    /// Creates a store targeting the first row of `table`.
    pub fn new(config: PgConnectionConfig, table: &str) -> Self {
        Self {
            config,
            statements: Arc::new(RecordStatements::new(table)),
        }
    }

    async fn connect_no_tls(&self) -> ContentionResult<Client> {
        let config: Config = self.config.with_db(Some(&UPDATE_WORKER_OPTIONS));
        let (client, connection) = config.connect(NoTls).await.map_err(connect_error)?;
        spawn_postgres_connection::<NoTls>(connection);

        info!("successfully connected to postgres without tls");

        Ok(client)
    }

    async fn connect_tls(&self) -> ContentionResult<Client> {
        let config: Config = self.config.with_db(Some(&UPDATE_WORKER_OPTIONS));

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader = BufReader::new(self.config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            root_store.add(cert?)?;
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config
            .connect(MakeRustlsConnect::new(tls_config))
            .await
            .map_err(connect_error)?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("successfully connected to postgres with tls");

        Ok(client)
    }
}

impl RecordStore for PostgresRecordStore {
    type Connection = PostgresRecordConnection;

    async fn connect(&self) -> ContentionResult<PostgresRecordConnection> {
        let client = if self.config.tls.enabled {
            self.connect_tls().await?
        } else {
            self.connect_no_tls().await?
        };

        Ok(PostgresRecordConnection {
            client,
            statements: self.statements.clone(),
        })
    }
}

/// Exclusive connection owned by one update worker.
#[derive(Debug)]
pub struct PostgresRecordConnection {
    client: Client,
    statements: Arc<RecordStatements>,
}

impl RecordConnection for PostgresRecordConnection {
    async fn read_modify_write(
        &mut self,
        policy: LockPolicy,
        content: &str,
    ) -> ContentionResult<UpdateOutcome> {
        // Dropping the transaction on an early return rolls it back, releasing any row lock.
        let transaction = self.client.transaction().await?;

        let Some(row) = transaction
            .query_opt(self.statements.select(policy), &[])
            .await?
        else {
            bail!(ErrorKind::RecordMissing, "The record table has no row");
        };
        let previous = Record {
            version: row.try_get(0)?,
            content: row.try_get::<_, Option<String>>(1)?.unwrap_or_default(),
        };
        let row_id: String = row.try_get(2)?;
        debug!(version = previous.version, %row_id, %policy, "read record");

        let next_version = previous.version + 1;
        let updated = transaction
            .query_opt(
                self.statements.conditional_update.as_str(),
                &[&content, &next_version, &previous.version, &row_id],
            )
            .await?;

        transaction.commit().await?;

        let outcome = match updated {
            Some(row) => UpdateOutcome::Committed {
                previous,
                version: row.try_get(0)?,
            },
            None => UpdateOutcome::Conflict { read: previous },
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_quote_the_table() {
        let statements = RecordStatements::new("post");

        assert_eq!(
            statements.select(LockPolicy::Optimistic),
            "select version::bigint, content::text, ctid::text from post limit 1"
        );
        assert_eq!(
            statements.select(LockPolicy::Pessimistic),
            "select version::bigint, content::text, ctid::text from post limit 1 for update"
        );
        assert_eq!(
            statements.conditional_update,
            "update post set content = $1, version = $2::bigint \
             where version = $3::bigint and ctid = $4::text::tid returning version::bigint"
        );
    }

    #[test]
    fn unusual_table_names_are_escaped() {
        let statements = RecordStatements::new("Blog Post");

        assert!(statements.select.ends_with(r#"from "Blog Post" limit 1"#));
        assert!(statements.conditional_update.starts_with(r#"update "Blog Post" set"#));
    }
}
