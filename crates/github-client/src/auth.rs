//! GitHub App authentication
//!
//! An RS256 app JWT mints short-lived installation tokens, cached per
//! installation until shortly before expiry. A 401 from the API evicts the
//! cached token so the next call re-mints.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use shared::config::GithubConfig;
use shared::{Error, Result};

/// Mint tokens this long before the cached one actually expires
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// App JWT lifetime (GitHub caps it at 10 minutes)
const JWT_LIFETIME_SECONDS: i64 = 600;

/// Allowed clock skew on the issued-at claim
const JWT_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// App credential holder and installation-token cache
pub struct AppAuth {
    app_id: u64,
    encoding_key: EncodingKey,
    api_base: String,
    http: reqwest::Client,
    tokens: DashMap<i64, CachedToken>,
}

impl AppAuth {
    /// Build from configuration; decodes the base64 PEM private key
    pub fn from_config(config: &GithubConfig, http: reqwest::Client) -> Result<Self> {
        let pem = base64::engine::general_purpose::STANDARD
            .decode(config.private_key_base64.trim())
            .map_err(|e| Error::config(format!("Invalid GITHUB_PRIVATE_KEY_BASE64: {}", e)))?;

        let encoding_key = EncodingKey::from_rsa_pem(&pem)
            .map_err(|e| Error::config(format!("Invalid GitHub App private key: {}", e)))?;

        Ok(Self {
            app_id: config.app_id,
            encoding_key,
            api_base: config.api_base.clone(),
            http,
            tokens: DashMap::new(),
        })
    }

    /// Short-lived app JWT for the installations endpoint
    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_SKEW_SECONDS,
            exp: now + JWT_LIFETIME_SECONDS,
            iss: self.app_id.to_string(),
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| Error::authentication(format!("Failed to sign app JWT: {}", e)))
    }

    /// Token for one installation, minted on demand and cached until close
    /// to expiry
    pub async fn installation_token(&self, installation_id: i64) -> Result<String> {
        if let Some(cached) = self.tokens.get(&installation_id) {
            if cached.expires_at > Utc::now() + Duration::minutes(EXPIRY_MARGIN_MINUTES) {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "flakeguard")
            .send()
            .await
            .map_err(|e| Error::network(format!("Token mint failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                let body: InstallationTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::network(format!("Malformed token response: {}", e)))?;

                tracing::debug!(
                    installation_id = installation_id,
                    expires_at = %body.expires_at,
                    "Minted installation token"
                );

                self.tokens.insert(
                    installation_id,
                    CachedToken {
                        token: body.token.clone(),
                        expires_at: body.expires_at,
                    },
                );
                Ok(body.token)
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(Error::authentication(format!(
                "App credentials rejected for installation {}",
                installation_id
            ))),
            reqwest::StatusCode::NOT_FOUND => Err(Error::not_found(
                "Installation",
                installation_id.to_string(),
            )),
            status => Err(Error::network(format!(
                "Token mint returned {}",
                status.as_u16()
            ))),
        }
    }

    /// Drop a cached token after the API rejected it
    pub fn evict(&self, installation_id: i64) {
        if self.tokens.remove(&installation_id).is_some() {
            tracing::debug!(
                installation_id = installation_id,
                "Evicted installation token after rejection"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_token_for_tests(
        &self,
        installation_id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) {
        self.tokens.insert(
            installation_id,
            CachedToken {
                token: token.to_string(),
                expires_at,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit throwaway key used only to exercise signing paths
    const TEST_KEY_PEM: &str = include_str!("testdata/test_app_key.pem");

    fn auth() -> AppAuth {
        let config = GithubConfig {
            app_id: 4242,
            private_key_base64: base64::engine::general_purpose::STANDARD
                .encode(TEST_KEY_PEM),
            webhook_secret: "shhh".to_string(),
            default_installation_id: None,
            api_base: "http://127.0.0.1:1".to_string(),
        };
        AppAuth::from_config(&config, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn test_jwt_has_three_segments() {
        let jwt = auth().app_jwt().unwrap();
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[test]
    fn test_bad_key_is_a_config_error() {
        let config = GithubConfig {
            app_id: 1,
            private_key_base64: base64::engine::general_purpose::STANDARD.encode("not a pem"),
            webhook_secret: "s".to_string(),
            default_installation_id: None,
            api_base: "http://127.0.0.1:1".to_string(),
        };
        let result = AppAuth::from_config(&config, reqwest::Client::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_base64_is_a_config_error() {
        let config = GithubConfig {
            app_id: 1,
            private_key_base64: "!!!not-base64!!!".to_string(),
            webhook_secret: "s".to_string(),
            default_installation_id: None,
            api_base: "http://127.0.0.1:1".to_string(),
        };
        assert!(AppAuth::from_config(&config, reqwest::Client::new()).is_err());
    }

    #[tokio::test]
    async fn test_cached_token_is_served_without_network() {
        let auth = auth();
        auth.cache_token_for_tests(7, "inst-token", Utc::now() + Duration::hours(1));
        let token = auth.installation_token(7).await.unwrap();
        assert_eq!(token, "inst-token");
    }

    #[tokio::test]
    async fn test_eviction_forces_remint() {
        let auth = auth();
        auth.cache_token_for_tests(7, "stale", Utc::now() + Duration::hours(1));
        auth.evict(7);
        // api_base points at a closed port, so the re-mint must fail loudly
        let result = auth.installation_token(7).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_nearly_expired_token_is_not_served() {
        let auth = auth();
        auth.cache_token_for_tests(7, "lapsing", Utc::now() + Duration::minutes(1));
        let result = auth.installation_token(7).await;
        // inside the expiry margin: mint attempt, which fails against the
        // closed port
        assert!(result.is_err());
    }
}
