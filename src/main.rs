//! jwk-auth - per-device session keys and the JWTs they sign

use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jwk_auth::{
    config::{Args, Command},
    db::{MemoryKeysetStore, MongoClient, MongoKeysetStore, SessionKeyStore},
    keys::ChaChaKeysetCipher,
    AuthService, JwtService, SessionKeyManager, UserIdentity,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr; stdout carries the JSON result
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("jwk_auth={},warn", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let store: Arc<dyn SessionKeyStore> = if args.memory_store {
        warn!("Using in-memory keyset store; keys are lost on exit");
        Arc::new(MemoryKeysetStore::new())
    } else {
        let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
        Arc::new(MongoKeysetStore::new(&mongo).await?)
    };

    let mut manager = SessionKeyManager::new(store, args.key_manager_config())?;
    if let Some(key) = &args.keyset_encryption_key {
        manager = manager.with_cipher(Arc::new(ChaChaKeysetCipher::from_base64(key)?));
        info!("Stored keysets are sealed with ChaCha20-Poly1305");
    }
    let manager = Arc::new(manager);

    let jwt = JwtService::new(manager.clone(), args.token_config())?;
    let auth = AuthService::new(manager, jwt);

    let output = run(&auth, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run(auth: &AuthService, command: Command) -> jwk_auth::Result<Value> {
    let output = match command {
        Command::Login {
            user_id,
            username,
            device,
        } => {
            let pair = auth
                .login(&UserIdentity::new(user_id, username), &device)
                .await?;
            serde_json::to_value(pair)?
        }

        Command::Logout { user_id, key_id } => {
            auth.logout(user_id, &key_id).await?;
            json!({ "logged_out": key_id })
        }

        Command::LogoutAll { user_id } => {
            let removed = auth.logout_all(user_id).await?;
            json!({ "user_id": user_id, "sessions_removed": removed })
        }

        Command::Refresh { token, username } => {
            let pair = auth.refresh(&token, &username).await?;
            serde_json::to_value(pair)?
        }

        Command::Verify { token, refresh } => {
            let user = if refresh {
                auth.verify_refresh(&token).await?
            } else {
                auth.verify_access(&token).await?
            };
            json!({ "key_id": auth.extract_key_id(&token)?, "user": user })
        }

        Command::Keys { user_id } => {
            let key_ids = auth.manager().list_session_keys(user_id).await?;
            json!({ "user_id": user_id, "key_ids": key_ids })
        }

        Command::Jwks { user_id } => serde_json::to_value(auth.public_keys(user_id).await?)?,
    };

    Ok(output)
}
