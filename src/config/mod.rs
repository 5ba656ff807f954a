use rocket::figment::{Figment, providers::{Env, Format, Toml}};
use rocket::Config as RocketConfig;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    MongoDb,
    Memory,
}

pub const DEFAULT_ADMIN_KEY: &str = "default-admin-key";

pub struct Config;

impl Config {
    fn figment() -> Figment {
        // Get the current profile
        let profile = env::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());

        Figment::from(RocketConfig::default())
            .merge(Toml::file("Rocket.toml").nested())
            .select(&profile)
            .merge(Env::prefixed("ROCKET_").split("__"))
    }

    pub fn storage_backend() -> StorageBackend {
        let raw: String = Self::figment()
            .extract_inner("storage_backend")
            .unwrap_or_else(|_| "mongodb".to_string());

        match raw.to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            _ => StorageBackend::MongoDb,
        }
    }

    pub fn mongodb_uri() -> String {
        Self::figment()
            .extract_inner("mongodb_uri")
            .unwrap_or_else(|_| "mongodb://localhost:27017/edu-entitlements".to_string())
    }

    pub fn database_name() -> String {
        Self::figment()
            .extract_inner("database_name")
            .unwrap_or_else(|_| "edu-entitlements".to_string())
    }

    pub fn jwt_secret() -> String {
        Self::figment()
            .extract_inner("jwt_secret")
            .unwrap_or_else(|_| "default-secret".to_string())
    }

    pub fn admin_api_key() -> String {
        Self::figment()
            .extract_inner("admin_api_key")
            .unwrap_or_else(|_| DEFAULT_ADMIN_KEY.to_string())
    }

    /// Seconds between in-process expiry sweeps; 0 disables them.
    pub fn sweep_interval_secs() -> u64 {
        Self::figment()
            .extract_inner("sweep_interval_secs")
            .unwrap_or(3600)
    }

    pub fn is_development() -> bool {
        let profile = env::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());
        profile == "development"
    }
}
