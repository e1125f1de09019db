use anyhow::Context;
use std::env;

#[derive(Debug)]
pub struct Config {
    pub database_url: String,
    /// Base URL of the Compass API, no trailing slash.
    pub compass_api_url: String,
    pub compass_api_key: String,
    pub compass_api_secret: String,
    pub compass_company_id: String,
    /// Shared secret presented by the external scheduler on /gps/batch.
    pub cron_secret: String,
    pub map_api_key: Option<String>,
    pub sentry_url: Option<String>,
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        _ = dotenvy::dotenv();

        Ok(Config {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required.")?,
            compass_api_url: env::var("COMPASS_API_URL")
                .context("COMPASS_API_URL is required.")?
                .trim_end_matches('/')
                .to_string(),
            compass_api_key: env::var("COMPASS_API_KEY").context("COMPASS_API_KEY is required.")?,
            compass_api_secret: env::var("COMPASS_API_SECRET")
                .context("COMPASS_API_SECRET is required.")?,
            compass_company_id: env::var("COMPASS_COMPANY_ID")
                .context("COMPASS_COMPANY_ID is required.")?,
            cron_secret: env::var("CRON_SECRET").context("CRON_SECRET is required.")?,
            map_api_key: env::var("MAP_API_KEY").ok(),
            sentry_url: env::var("SENTRY_URL").ok(),
        })
    }
}
