//! Environment driven configuration

use anyhow::{Context, anyhow};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub change_feed_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<AppConfig> {
        dotenvy::dotenv().ok();

        let database_url = database_url().ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let bind_address = env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_owned())
            .parse()
            .context("BIND_ADDRESS is not a socket address")?;

        let allowed_origins = parse_origins(
            &env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_owned()),
        );

        Ok(AppConfig {
            database_url,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            bind_address,
            allowed_origins,
            change_feed_capacity: parse_var("CHANGE_FEED_CAPACITY", DEFAULT_CHANGE_FEED_CAPACITY)?,
        })
    }
}

pub fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();
    env::var("DATABASE_URL").ok()
}

pub fn database_max_connections() -> u32 {
    parse_var("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS).unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

pub fn change_feed_capacity() -> usize {
    parse_var("CHANGE_FEED_CAPACITY", DEFAULT_CHANGE_FEED_CAPACITY)
        .unwrap_or(DEFAULT_CHANGE_FEED_CAPACITY)
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value `{value}`")),
        Err(_) => Ok(default),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_origins_and_drops_blanks() {
        let origins = parse_origins(" http://a.test ,,http://b.test ");
        assert_eq!(origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn missing_variable_falls_back_to_default() {
        let value: u32 = parse_var("CLINIC_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
