/// Configuration loading for the world model server.
///
/// The configuration is a plain `key=value` text file; lines starting with
/// `#` are comments and blank lines are ignored. Recognized keys are
/// `db_name`, `user`, `password`, `db_host`, `solver_port`, and
/// `client_port`. Unknown keys are ignored with a warning so newer files
/// keep working against older binaries.
///
/// Passing no identity keys at all selects a valid non-persistent mode in
/// which the persistence pool is replaced by a no-op collaborator; a
/// partial identity is a configuration error.
use std::path::Path;

use tracing::warn;

use crate::error::{WmError, WmResult};

/// Default solver listener port.
pub const DEFAULT_SOLVER_PORT: u16 = 7009;
/// Default client listener port.
pub const DEFAULT_CLIENT_PORT: u16 = 7010;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Database to store attributes in; `None` disables persistence.
    pub db_name: Option<String>,
    /// Database account name.
    pub user: Option<String>,
    /// Database account password.
    pub password: Option<String>,
    /// Database host.
    pub db_host: String,
    /// Port accepting solver connections.
    pub solver_port: u16,
    /// Port accepting client connections.
    pub client_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_name: None,
            user: None,
            password: None,
            db_host: "localhost".to_string(),
            solver_port: DEFAULT_SOLVER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
        }
    }
}

impl Config {
    /// Read a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> WmResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_str_contents(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from file contents.
    fn from_str_contents(text: &str) -> WmResult<Self> {
        let mut config = Config::default();
        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = index + 1, "config line without '=', skipping");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "db_name" => config.db_name = Some(value.to_string()),
                "user" => config.user = Some(value.to_string()),
                "password" => config.password = Some(value.to_string()),
                "db_host" => config.db_host = value.to_string(),
                "solver_port" => config.solver_port = parse_port(key, value)?,
                "client_port" => config.client_port = parse_port(key, value)?,
                other => warn!(key = other, "unknown configuration key ignored"),
            }
        }
        Ok(config)
    }

    /// True when all three identity keys are present.
    pub fn persistence_enabled(&self) -> bool {
        self.db_name.is_some() && self.user.is_some() && self.password.is_some()
    }

    /// Reject configurations that name only part of a database identity.
    fn validate(&self) -> WmResult<()> {
        let present =
            [&self.db_name, &self.user, &self.password].iter().filter(|v| v.is_some()).count();
        if present != 0 && present != 3 {
            return Err(WmError::Config(
                "db_name, user, and password must be given together (or all omitted \
                 for non-persistent mode)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> WmResult<u16> {
    value
        .parse::<u16>()
        .map_err(|_| WmError::Config(format!("{key} must be a port number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_full_persistent_config() {
        let file = write_config(
            "# world model settings\n\
             db_name=world\n\
             user=wm\n\
             password=secret\n\
             solver_port=8009\n\
             client_port=8010\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.persistence_enabled());
        assert_eq!(config.db_name.as_deref(), Some("world"));
        assert_eq!(config.solver_port, 8009);
        assert_eq!(config.client_port, 8010);
        assert_eq!(config.db_host, "localhost");
    }

    #[test]
    fn test_empty_config_is_non_persistent() {
        let file = write_config("# nothing but comments\n\n");
        let config = Config::from_file(file.path()).unwrap();
        assert!(!config.persistence_enabled());
        assert_eq!(config.solver_port, DEFAULT_SOLVER_PORT);
        assert_eq!(config.client_port, DEFAULT_CLIENT_PORT);
    }

    #[test]
    fn test_partial_identity_rejected() {
        let file = write_config("db_name=world\nuser=wm\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, WmError::Config(_)));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let file = write_config("replication=yes\nsolver_port=7100\n");
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.solver_port, 7100);
    }

    #[test]
    fn test_bad_port_rejected() {
        let file = write_config("solver_port=alpha\n");
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_values_may_contain_equals() {
        let file = write_config("db_name=x\nuser=u\npassword=a=b=c\n");
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.password.as_deref(), Some("a=b=c"));
    }
}
