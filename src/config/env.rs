// # Environment Resolution
//
// Resolves the recognized variable set into a `DbConfig`. A full `*_DSN`
// overrides every individual endpoint field; the remaining variables patch
// fields one by one. Container-bootstrap variables are handled by the
// deployment tooling, not here.

use std::env;

use super::DbConfig;
use crate::dsn::DsnBuilder;
use crate::error::{DbError, Result};

fn var(prefix: &str, name: &str) -> Option<String> {
    env::var(format!("{prefix}_{name}")).ok().filter(|v| !v.is_empty())
}

impl DbConfig {
    /// Resolve configuration from `{prefix}_DSN`, `{prefix}_DRIVER`,
    /// `{prefix}_HOST`, `{prefix}_PORT`, `{prefix}_USERNAME`,
    /// `{prefix}_PASSWORD`, `{prefix}_DATABASE` and `{prefix}_PARAMS`,
    /// starting from defaults.
    pub fn from_env(prefix: &str) -> Result<DbConfig> {
        let mut config = DbConfig::default();
        config.driver = "mysql".to_string();

        if let Some(dsn) = var(prefix, "DSN") {
            config.endpoint = DsnBuilder::parse(&dsn)?.into_endpoint();
        } else {
            if let Some(host) = var(prefix, "HOST") {
                config.endpoint.host = host;
            }
            if let Some(port) = var(prefix, "PORT") {
                config.endpoint.port = port.parse().map_err(|_| {
                    DbError::Configuration(format!("{prefix}_PORT is not a valid port: {port:?}"))
                })?;
            }
            if let Some(username) = var(prefix, "USERNAME") {
                config.endpoint.username = username;
            }
            if let Some(password) = var(prefix, "PASSWORD") {
                config.endpoint.password = password;
            }
            if let Some(database) = var(prefix, "DATABASE") {
                config.endpoint.database = database;
            }
        }

        if let Some(driver) = var(prefix, "DRIVER") {
            config.driver = driver;
        }

        if let Some(params) = var(prefix, "PARAMS") {
            for pair in params.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        config
                            .endpoint
                            .params
                            .insert(k.to_string(), v.to_string());
                    }
                    None => {
                        return Err(DbError::Configuration(format!(
                            "{prefix}_PARAMS entry {pair:?} is not k=v"
                        )))
                    }
                }
            }
        }

        Ok(config)
    }
}
