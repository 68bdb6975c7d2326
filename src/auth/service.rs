//! Login, logout, refresh and verification flows.
//!
//! Composes the session key manager and the JWT service. Each login binds a
//! token pair to a fresh device key; logging in again on the same device
//! category replaces that key and invalidates the earlier pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::keys::keyset::parse_key_id;
use crate::keys::{JwkSet, SessionKeyManager};
use crate::types::{AuthError, Result, UserId};

use super::jwt::{extract_key_id, Claims, JwtService, TokenType};

/// Authenticated user as seen by the token layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,

    /// Empty for identities recovered from refresh tokens
    pub username: String,
}

impl UserIdentity {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Access and refresh token issued together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,

    /// Always `"Bearer"`
    pub token_type: String,

    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Authentication flows over device session keys.
#[derive(Clone)]
pub struct AuthService {
    manager: Arc<SessionKeyManager>,
    jwt: JwtService,
}

impl AuthService {
    pub fn new(manager: Arc<SessionKeyManager>, jwt: JwtService) -> Self {
        Self { manager, jwt }
    }

    pub fn manager(&self) -> &Arc<SessionKeyManager> {
        &self.manager
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    /// Start a device session, replacing any earlier session of the same
    /// device category.
    pub async fn login(&self, user: &UserIdentity, device_category: &str) -> Result<TokenPair> {
        let key_id = self
            .manager
            .create_session_key(user.user_id, device_category)
            .await?;

        let pair = self.issue_pair(user, &key_id).await?;
        info!(user_id = user.user_id, key_id = %key_id, device_category, "User logged in");
        Ok(pair)
    }

    /// End one device session. Succeeds if the session is already gone.
    pub async fn logout(&self, user_id: UserId, key_id: &str) -> Result<()> {
        match self.manager.delete_session_key(user_id, key_id).await {
            Ok(()) => {
                info!(user_id, key_id, "User logged out");
                Ok(())
            }
            Err(AuthError::KeyNotFound(_)) => {
                debug!(user_id, key_id, "Logout of unknown session");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// End every device session of a user, returning how many were removed.
    pub async fn logout_all(&self, user_id: UserId) -> Result<usize> {
        let mut removed = 0;
        for key_id in self.manager.list_session_keys(user_id).await? {
            match self.manager.delete_session_key(user_id, &key_id).await {
                Ok(()) => removed += 1,
                Err(AuthError::KeyNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(user_id, removed, "User logged out of all devices");
        Ok(removed)
    }

    /// Exchange a refresh token for a new pair on a rotated device key.
    pub async fn refresh(&self, refresh_token: &str, username: &str) -> Result<TokenPair> {
        let claims = self.jwt.verify_as(refresh_token, TokenType::Refresh).await?;
        let device_category = self.device_category_of(&claims.kid).await?;

        let key_id = self
            .manager
            .create_session_key(claims.user_id, &device_category)
            .await?;

        let user = UserIdentity::new(claims.user_id, username);
        let pair = self.issue_pair(&user, &key_id).await?;

        info!(
            user_id = claims.user_id,
            old_key_id = %claims.kid,
            key_id = %key_id,
            "Rotated session key on refresh"
        );
        Ok(pair)
    }

    /// Verify an access token and recover the user.
    pub async fn verify_access(&self, token: &str) -> Result<UserIdentity> {
        let claims = self.jwt.verify_as(token, TokenType::Access).await?;
        let username = claims.username.clone().ok_or_else(|| {
            AuthError::MalformedToken("access token has no 'username' claim".into())
        })?;
        Ok(UserIdentity::new(claims.user_id, username))
    }

    /// Verify a refresh token and recover the user id.
    pub async fn verify_refresh(&self, token: &str) -> Result<UserIdentity> {
        let claims = self.jwt.verify_as(token, TokenType::Refresh).await?;
        Ok(identity_from_refresh(&claims))
    }

    /// Key-id of a token, without verifying it.
    pub fn extract_key_id(&self, token: &str) -> Result<String> {
        extract_key_id(token)
    }

    /// Public keys of one user, or of every user.
    pub async fn public_keys(&self, user_id: Option<UserId>) -> Result<JwkSet> {
        match user_id {
            Some(user_id) => self.manager.get_public_keys_for_user(user_id).await,
            None => self.manager.get_all_public_keys().await,
        }
    }

    async fn issue_pair(&self, user: &UserIdentity, key_id: &str) -> Result<TokenPair> {
        let access_token = self
            .jwt
            .issue_access(user.user_id, &user.username, key_id)
            .await?;
        let refresh_token = self.jwt.issue_refresh(user.user_id, key_id).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.config().access_ttl.as_secs(),
        })
    }

    async fn device_category_of(&self, key_id: &str) -> Result<String> {
        match self.manager.get_signing_key(key_id).await {
            Ok(key) => Ok(key.device_category().to_string()),
            Err(AuthError::KeyNotFound(_)) => parse_key_id(key_id)
                .map(|parts| parts.device_category)
                .ok_or_else(|| AuthError::MalformedToken(format!("unrecognised key id {key_id}"))),
            Err(e) => Err(e),
        }
    }
}

fn identity_from_refresh(claims: &Claims) -> UserIdentity {
    UserIdentity::new(claims.user_id, claims.username.clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::TokenConfig;
    use crate::db::store::MemoryKeysetStore;
    use crate::keys::KeyManagerConfig;

    fn service() -> AuthService {
        let store = Arc::new(MemoryKeysetStore::new());
        let manager =
            Arc::new(SessionKeyManager::new(store, KeyManagerConfig::default()).unwrap());
        let jwt = JwtService::new(manager.clone(), TokenConfig::default()).unwrap();
        AuthService::new(manager, jwt)
    }

    #[tokio::test]
    async fn test_login_returns_bearer_pair() {
        let auth = service();
        let pair = auth
            .login(&UserIdentity::new(1, "alice"), "web")
            .await
            .unwrap();

        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 15 * 60);

        let user = auth.verify_access(&pair.access_token).await.unwrap();
        assert_eq!(user, UserIdentity::new(1, "alice"));

        let refresh_user = auth.verify_refresh(&pair.refresh_token).await.unwrap();
        assert_eq!(refresh_user.user_id, 1);
        assert!(refresh_user.username.is_empty());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let auth = service();
        let pair = auth
            .login(&UserIdentity::new(2, "bob"), "web")
            .await
            .unwrap();
        let kid = auth.extract_key_id(&pair.access_token).unwrap();

        auth.logout(2, &kid).await.unwrap();
        auth.logout(2, &kid).await.unwrap();

        assert!(auth.verify_access(&pair.access_token).await.is_err());
    }

    #[tokio::test]
    async fn test_tokens_are_not_interchangeable() {
        let auth = service();
        let pair = auth
            .login(&UserIdentity::new(3, "carol"), "android")
            .await
            .unwrap();

        assert!(matches!(
            auth.verify_access(&pair.refresh_token).await,
            Err(AuthError::InvalidTokenType { .. })
        ));
        assert!(matches!(
            auth.refresh(&pair.access_token, "carol").await,
            Err(AuthError::InvalidTokenType { .. })
        ));
    }
}
