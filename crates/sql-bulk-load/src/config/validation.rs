//! Configuration validation.

use super::{Config, DriverKind, InsertMethod};
use crate::coercion::SetterKind;
use crate::error::{LoadError, Result};
use chrono_tz::Tz;
use std::collections::HashSet;

/// Upper bound on retry_limit; past this the doubling wait is pinned at the cap anyway.
const MAX_RETRY_LIMIT: u32 = 64;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let conn = &config.connection;
    let output = &config.output;

    // Connection validation
    match &conn.url {
        Some(url) => {
            if !conn.host.is_empty() {
                return Err(LoadError::Config(
                    "connection.url and connection.host are mutually exclusive".into(),
                ));
            }
            if url.is_empty() {
                return Err(LoadError::Config("connection.url must not be empty".into()));
            }
        }
        None => {
            if conn.host.is_empty() {
                return Err(LoadError::Config(
                    "connection.host is required (or set connection.url)".into(),
                ));
            }
            if conn.database.is_empty() {
                return Err(LoadError::Config("connection.database is required".into()));
            }
            if conn.user.is_empty() {
                return Err(LoadError::Config("connection.user is required".into()));
            }
        }
    }
    match conn.ssl_mode.as_str() {
        "disable" | "require" | "verify-ca" | "verify-full" => {}
        other => {
            return Err(LoadError::Config(format!(
                "connection.ssl_mode must be one of disable, require, verify-ca, verify-full, got '{}'",
                other
            )))
        }
    }

    // Output validation
    if output.table.is_empty() {
        return Err(LoadError::Config("output.table is required".into()));
    }
    if output.batch_size == 0 {
        return Err(LoadError::Config("output.batch_size must be at least 1".into()));
    }
    if output.retry_limit > MAX_RETRY_LIMIT {
        return Err(LoadError::Config(format!(
            "output.retry_limit must be at most {}",
            MAX_RETRY_LIMIT
        )));
    }
    if output.retry_wait > output.max_retry_wait {
        return Err(LoadError::Config(
            "output.retry_wait must not exceed output.max_retry_wait".into(),
        ));
    }
    if output.insert_method == InsertMethod::Copy && conn.driver != DriverKind::Postgres {
        return Err(LoadError::Config(format!(
            "output.insert_method 'copy' requires the postgres driver, got '{}'",
            conn.driver
        )));
    }
    if output.before_load.is_some() && output.mode.commit_by_swap_table() {
        return Err(LoadError::Config(format!(
            "output.before_load is not supported in {} mode",
            output.mode
        )));
    }
    if output.merge_keys.is_some() && !output.mode.is_merge() {
        return Err(LoadError::Config(format!(
            "output.merge_keys is only used by merge modes, not {}",
            output.mode
        )));
    }
    check_timezone("output.default_timezone", &output.default_timezone)?;

    for (name, option) in &output.column_options {
        if option.value_type != "coerce" && SetterKind::from_value_type(&option.value_type).is_none()
        {
            return Err(LoadError::Config(format!(
                "output.column_options.{}.value_type '{}' is not a known value type",
                name, option.value_type
            )));
        }
        if let Some(tz) = &option.timezone {
            check_timezone(&format!("output.column_options.{}.timezone", name), tz)?;
        }
    }

    // Input validation - only for the bundled runner's source
    let input = &config.input;
    if !input.path.is_empty() && input.columns.is_empty() {
        return Err(LoadError::Config(
            "input.columns must list at least one column".into(),
        ));
    }
    let mut seen = HashSet::new();
    for column in &input.columns {
        if !seen.insert(column.name.as_str()) {
            return Err(LoadError::Config(format!(
                "input.columns contains duplicate column '{}'",
                column.name
            )));
        }
    }
    if let Some(0) = input.workers {
        return Err(LoadError::Config("input.workers must be at least 1".into()));
    }
    if let Some(0) = input.page_size {
        return Err(LoadError::Config("input.page_size must be at least 1".into()));
    }

    Ok(())
}

fn check_timezone(field: &str, name: &str) -> Result<()> {
    name.parse::<Tz>()
        .map(|_| ())
        .map_err(|_| LoadError::Config(format!("{} '{}' is not a known timezone", field, name)))
}
