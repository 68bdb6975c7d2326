//! Configuration for jwk-auth
//!
//! CLI arguments and environment variable handling using clap.

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::auth::TokenConfig;
use crate::keys::codec::MIN_KEY_BITS;
use crate::keys::keyset::validate_device_category;
use crate::keys::{KeyManagerConfig, KeysetCacheConfig};
use crate::types::UserId;

/// jwk-auth - per-device session keys and the JWTs they sign
#[derive(Parser, Debug, Clone)]
#[command(name = "jwk-auth")]
#[command(about = "Per-device RSA session keys and JWT issuance")]
pub struct Args {
    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "jwk_auth")]
    pub mongodb_db: String,

    /// Keep keysets in process memory instead of MongoDB
    #[arg(long, env = "MEMORY_STORE", default_value = "false")]
    pub memory_store: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// RSA modulus size for new device keys
    #[arg(long, env = "RSA_KEY_BITS", default_value = "2048")]
    pub rsa_key_bits: usize,

    /// Access token lifetime in seconds
    #[arg(long, env = "ACCESS_TOKEN_TTL_SECS", default_value = "900")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "REFRESH_TOKEN_TTL_SECS", default_value = "604800")]
    pub refresh_token_ttl_secs: u64,

    /// Capacity of the parsed key cache
    #[arg(long, env = "KEY_CACHE_CAPACITY", default_value = "1000")]
    pub key_cache_capacity: usize,

    /// Capacity of the keyset cache
    #[arg(long, env = "KEYSET_CACHE_CAPACITY", default_value = "500")]
    pub keyset_cache_capacity: usize,

    /// Capacity of the key owner cache
    #[arg(long, env = "OWNER_CACHE_CAPACITY", default_value = "2000")]
    pub owner_cache_capacity: usize,

    /// Cache entry lifetime in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "1800")]
    pub cache_ttl_secs: u64,

    /// Interval between cache sweeps in seconds
    #[arg(long, env = "CACHE_CLEANUP_INTERVAL_SECS", default_value = "300")]
    pub cache_cleanup_interval_secs: u64,

    /// Base64 32-byte key sealing stored keysets (plaintext JSON when unset)
    #[arg(long, env = "KEYSET_ENCRYPTION_KEY", hide_env_values = true)]
    pub keyset_encryption_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Operation to run
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a device session and print its token pair
    Login {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        username: String,
        #[arg(long)]
        device: String,
    },

    /// End one device session
    Logout {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        key_id: String,
    },

    /// End every device session of a user
    LogoutAll {
        #[arg(long)]
        user_id: UserId,
    },

    /// Exchange a refresh token for a new pair
    Refresh {
        #[arg(long)]
        token: String,
        #[arg(long)]
        username: String,
    },

    /// Verify a token and print the user it belongs to
    Verify {
        #[arg(long)]
        token: String,
        /// Expect a refresh token instead of an access token
        #[arg(long)]
        refresh: bool,
    },

    /// List a user's active key-ids
    Keys {
        #[arg(long)]
        user_id: UserId,
    },

    /// Print the public key set
    Jwks {
        /// Only this user's keys
        #[arg(long)]
        user_id: Option<UserId>,
    },
}

impl Args {
    /// Cache settings from the CLI
    pub fn cache_config(&self) -> KeysetCacheConfig {
        KeysetCacheConfig {
            parsed_key_capacity: self.key_cache_capacity,
            keyset_capacity: self.keyset_cache_capacity,
            key_owner_capacity: self.owner_cache_capacity,
            ttl: Duration::from_secs(self.cache_ttl_secs),
            cleanup_interval: Duration::from_secs(self.cache_cleanup_interval_secs),
        }
    }

    /// Manager settings from the CLI
    pub fn key_manager_config(&self) -> KeyManagerConfig {
        KeyManagerConfig {
            key_bits: self.rsa_key_bits,
            cache: self.cache_config(),
        }
    }

    /// Token lifetimes from the CLI
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_ttl: Duration::from_secs(self.access_token_ttl_secs),
            refresh_ttl: Duration::from_secs(self.refresh_token_ttl_secs),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.rsa_key_bits < MIN_KEY_BITS {
            return Err(format!("RSA_KEY_BITS must be at least {MIN_KEY_BITS}"));
        }

        self.token_config().validate().map_err(|e| e.to_string())?;

        if self.key_cache_capacity == 0
            || self.keyset_cache_capacity == 0
            || self.owner_cache_capacity == 0
        {
            return Err("cache capacities must be greater than zero".to_string());
        }

        if self.cache_ttl_secs == 0 || self.cache_cleanup_interval_secs == 0 {
            return Err("CACHE_TTL_SECS and CACHE_CLEANUP_INTERVAL_SECS must be positive".to_string());
        }

        if let Command::Login { device, .. } = &self.command {
            validate_device_category(device).map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["jwk-auth", "--memory-store"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["keys", "--user-id", "7"]);
        assert!(args.validate().is_ok());
        assert!(args.memory_store);

        let tokens = args.token_config();
        assert_eq!(tokens.access_ttl, Duration::from_secs(15 * 60));
        assert_eq!(tokens.refresh_ttl, Duration::from_secs(7 * 24 * 60 * 60));

        let cache = args.cache_config();
        assert_eq!(cache.parsed_key_capacity, 1000);
        assert_eq!(cache.keyset_capacity, 500);
        assert_eq!(cache.key_owner_capacity, 2000);
        assert_eq!(cache.ttl, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_rejects_small_keys() {
        let args = parse(&["--rsa-key-bits", "1024", "keys", "--user-id", "7"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_device() {
        let args = parse(&[
            "login",
            "--user-id",
            "1",
            "--username",
            "alice",
            "--device",
            "web app",
        ]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_subcommands_parse() {
        let args = parse(&["verify", "--token", "abc", "--refresh"]);
        assert!(matches!(args.command, Command::Verify { refresh: true, .. }));

        let args = parse(&["logout-all", "--user-id", "3"]);
        assert!(matches!(args.command, Command::LogoutAll { user_id: 3 }));

        let args = parse(&["jwks"]);
        assert!(matches!(args.command, Command::Jwks { user_id: None }));
    }
}
