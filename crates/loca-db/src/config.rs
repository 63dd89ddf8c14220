use std::env;
use std::path::PathBuf;

/// Environment variable overriding the database URL.
pub const DATABASE_URL_ENV: &str = "LOCA_DATABASE_URL";

/// Database configuration.
///
/// Reads from the `LOCA_DATABASE_URL` environment variable, falling back to
/// a SQLite file under the user's data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// URL used when neither the environment nor a data directory is
    /// available.
    pub const DEFAULT_URL: &str = "sqlite://loca.db";

    /// URL of a private in-memory database.
    pub const MEMORY_URL: &str = "sqlite::memory:";

    /// Build a config from the environment.
    ///
    /// Priority: `LOCA_DATABASE_URL` env var, then [`DbConfig::default_url`].
    pub fn from_env() -> Self {
        let database_url = env::var(DATABASE_URL_ENV).unwrap_or_else(|_| Self::default_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// `sqlite://<data_dir>/loca/loca.db`, or [`DbConfig::DEFAULT_URL`] when
    /// the platform has no data directory.
    pub fn default_url() -> String {
        match default_database_path() {
            Some(path) => format!("sqlite://{}", path.display()),
            None => Self::DEFAULT_URL.to_owned(),
        }
    }

    /// `true` when the URL names an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// Filesystem path of the database file, if the URL names one.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.is_memory() {
            return None;
        }
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().filter(|s| !s.is_empty())?;
        Some(PathBuf::from(path))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// `<data_dir>/loca/loca.db`.
fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("loca").join("loca.db"))
}
