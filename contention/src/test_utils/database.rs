use contention_config::shared::{IntoConnectOptions, PgConnectionConfig, TlsConfig};
use pg_escape::quote_identifier;
use secrecy::SecretString;
use tokio_postgres::{Client, Config, NoTls};
use uuid::Uuid;

use crate::store::postgres::PostgresRecordStore;

/// Table created in every test database.
pub const TEST_RECORD_TABLE: &str = "post";

/// Builds the connection configuration of a uniquely named test database.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(SecretString::new),
        tls: TlsConfig::disabled(),
        keepalive: None,
    }
}

async fn connect(config: Config) -> Client {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .expect("Failed to connect to Postgres");
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("warning: test postgres connection failed: {err}");
        }
    });

    client
}

/// Isolated database holding a record table seeded with `version = 0`.
///
/// Call [`TestDatabase::drop_database`] at the end of the test, there is no async drop.
pub struct TestDatabase {
    /// Connection settings targeting the test database.
    pub config: PgConnectionConfig,
    /// Client connected to the test database, for setup and assertions.
    pub client: Client,
}

impl TestDatabase {
    /// Creates the database and its record table.
    ///
    /// # Panics
    ///
    /// Panics if the database or the table cannot be created.
    pub async fn new() -> Self {
        let config = local_pg_connection_config();

        let admin = connect(config.without_db(None)).await;
        admin
            .execute(
                format!("create database {}", quote_identifier(&config.name)).as_str(),
                &[],
            )
            .await
            .expect("Failed to create test database");

        let client = connect(config.with_db(None)).await;
        client
            .batch_execute(&format!(
                "create table {TEST_RECORD_TABLE} (version integer not null, content text);
                 insert into {TEST_RECORD_TABLE} (version, content) values (0, 'initial');"
            ))
            .await
            .expect("Failed to create the record table");

        Self { config, client }
    }

    /// Returns a store targeting the record table of this database.
    pub fn record_store(&self) -> PostgresRecordStore {
        PostgresRecordStore::new(self.config.clone(), TEST_RECORD_TABLE)
    }

    /// Reads the current `(version, content)` of the record.
    pub async fn record(&self) -> (i64, Option<String>) {
        let row = self
            .client
            .query_one(
                format!("select version::bigint, content from {TEST_RECORD_TABLE} limit 1")
                    .as_str(),
                &[],
            )
            .await
            .expect("Failed to read the record");

        (row.get(0), row.get(1))
    }

    /// Appends a row to the record table, next to the seeded one.
    pub async fn insert_record(&self, version: i32, content: &str) {
        self.client
            .execute(
                format!("insert into {TEST_RECORD_TABLE} (version, content) values ($1, $2)")
                    .as_str(),
                &[&version, &content],
            )
            .await
            .expect("Failed to insert a record");
    }

    /// Returns the version of every row of the record table, in ascending order.
    pub async fn versions(&self) -> Vec<i64> {
        self.client
            .query(
                format!("select version::bigint from {TEST_RECORD_TABLE} order by version")
                    .as_str(),
                &[],
            )
            .await
            .expect("Failed to read the record versions")
            .iter()
            .map(|row| row.get(0))
            .collect()
    }

    /// Deletes every row of the record table.
    pub async fn clear_records(&self) {
        self.client
            .execute(format!("delete from {TEST_RECORD_TABLE}").as_str(), &[])
            .await
            .expect("Failed to clear the record table");
    }

    /// Terminates remaining connections and drops the database.
    ///
    /// Never panics, so cleanup does not mask the outcome of a test.
    pub async fn drop_database(self) {
        let Self { config, client } = self;
        drop(client);

        let admin_config: Config = config.without_db(None);
        let admin = match admin_config.connect(NoTls).await {
            Ok((admin, connection)) => {
                tokio::spawn(connection);
                admin
            }
            Err(err) => {
                eprintln!("warning: failed to connect to Postgres for cleanup: {err}");
                return;
            }
        };

        if let Err(err) = admin
            .execute(
                "select pg_terminate_backend(pid) from pg_stat_activity where datname = $1 and pid <> pg_backend_pid()",
                &[&config.name],
            )
            .await
        {
            eprintln!(
                "warning: failed to terminate connections for database {}: {err}",
                config.name
            );
        }

        if let Err(err) = admin
            .execute(
                format!("drop database if exists {}", quote_identifier(&config.name)).as_str(),
                &[],
            )
            .await
        {
            eprintln!("warning: failed to drop database {}: {err}", config.name);
        }
    }
}
