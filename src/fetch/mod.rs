//! Read-only clients for the player and battle services.
//!
//! Used on two paths only: resolving a player seen for the first time, and
//! the one-shot bootstrap replay. Calls carry a bounded timeout and fail
//! closed; the engine treats any failure here as an upstream degradation,
//! never as a reason to block the consumer.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::config::UPSTREAM_TIMEOUT;
use crate::models::{Battle, Player};

/// Errors that can occur while calling an upstream service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Player {0} not found upstream")]
    PlayerNotFound(i64),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
}

fn validated_base(base_url: String) -> Result<String, FetchError> {
    Url::parse(&base_url).map_err(|_| FetchError::InvalidUrl(base_url.clone()))?;
    Ok(base_url.trim_end_matches('/').to_string())
}

/// Authoritative player lookups.
#[async_trait]
pub trait PlayerDirectory: Send + Sync {
    async fn fetch_player(&self, player_id: i64) -> Result<Player, FetchError>;

    /// Every known player; used once, during bootstrap.
    async fn fetch_all_players(&self) -> Result<Vec<Player>, FetchError>;
}

/// Historical battle pulls for bootstrap.
#[async_trait]
pub trait BattleLog: Send + Sync {
    async fn fetch_completed_battles(&self) -> Result<Vec<Battle>, FetchError>;
}

/// HTTP client for the player service.
pub struct HttpPlayerClient {
    client: Client,
    base_url: String,
}

impl HttpPlayerClient {
    pub fn new(base_url: String) -> Result<Self, FetchError> {
        let base_url = validated_base(base_url)?;
        let client = Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PlayerDirectory for HttpPlayerClient {
    async fn fetch_player(&self, player_id: i64) -> Result<Player, FetchError> {
        let url = format!("{}/players/{}", self.base_url, player_id);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::PlayerNotFound(player_id)),
            status if !status.is_success() => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
            _ => Ok(response.json().await?),
        }
    }

    async fn fetch_all_players(&self) -> Result<Vec<Player>, FetchError> {
        let url = format!("{}/players", self.base_url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

/// HTTP client for the battle service.
pub struct HttpBattleClient {
    client: Client,
    base_url: String,
}

impl HttpBattleClient {
    pub fn new(base_url: String) -> Result<Self, FetchError> {
        let base_url = validated_base(base_url)?;
        let client = Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl BattleLog for HttpBattleClient {
    async fn fetch_completed_battles(&self) -> Result<Vec<Battle>, FetchError> {
        let url = format!("{}/battles", self.base_url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let battles: Vec<Battle> = response.json().await?;
        Ok(battles.into_iter().filter(Battle::is_completed).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_base_trims_trailing_slash() {
        let base = validated_base("http://player-service:8001/".into()).unwrap();
        assert_eq!(base, "http://player-service:8001");
    }

    #[test]
    fn test_validated_base_rejects_junk() {
        assert!(matches!(
            validated_base("not a url".into()),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
