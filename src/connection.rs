//! Connection parameters handed to callers once an instance is ready.

use serde::Serialize;

/// Describes how to reach a running instance.
///
/// The values are derived from the instance configuration and the port the
/// allocator handed out; they are only meaningful while the instance is
/// [`Ready`](crate::InstanceState::Ready).
///
/// # Examples
/// ```
/// use tiny_postgres::ConnectionParams;
///
/// let params = ConnectionParams::new("127.0.0.1", 54_321, "tester", "postgres");
/// assert_eq!(params.url(), "postgresql://tester@127.0.0.1:54321/postgres");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionParams {
    host: String,
    port: u16,
    user: String,
    database: String,
}

impl ConnectionParams {
    /// Builds connection parameters from their parts.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            database: database.into(),
        }
    }

    /// Returns the host the server listens on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port the server listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the superuser created by `initdb`.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the default database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Builds a libpq-compatible URL for the default database.
    #[must_use]
    pub fn url(&self) -> String {
        self.url_for(&self.database)
    }

    /// Builds a libpq-compatible URL for `database` on the same server.
    #[must_use]
    pub fn url_for(&self, database: &str) -> String {
        format!(
            "postgresql://{}@{}:{}/{database}",
            self.user, self.host, self.port
        )
    }

    /// Produces a `postgres` client configuration targeting the instance.
    #[must_use]
    pub fn to_client_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database)
            .application_name("tiny_postgres");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_targets_other_databases() {
        let params = ConnectionParams::new("localhost", 5433, "fixture_user", "postgres");

        assert_eq!(
            params.url_for("app_test"),
            "postgresql://fixture_user@localhost:5433/app_test"
        );
    }

    #[test]
    fn to_client_config_reflects_parameters() {
        let params = ConnectionParams::new("127.0.0.1", 55_321, "fixture_user", "fixture_db");
        let config = params.to_client_config();

        assert_eq!(config.get_ports(), &[55_321]);
        assert_eq!(config.get_user(), Some("fixture_user"));
        assert_eq!(config.get_dbname(), Some("fixture_db"));
    }
}
