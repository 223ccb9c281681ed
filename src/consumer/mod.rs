//! Broker event consumer.
//!
//! One long-lived worker on a durable queue bound to the battle and player
//! topic exchanges. Delivery is at-least-once with manual acknowledgement:
//! logic errors (malformed payloads, validation rejects, missing upstream
//! players) are acked so a poison message never blocks the queue, while
//! transient storage failures are nacked back for redelivery.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::engine::{EngineError, RankingEngine};
use crate::models::{BattleCompletedEvent, PlayerDeletedEvent};

pub const BATTLE_EXCHANGE: &str = "battle.events";
pub const PLAYER_EXCHANGE: &str = "player.events";
pub const RANKING_QUEUE: &str = "ranking.updates";
pub const BATTLE_COMPLETED_KEY: &str = "battle.completed";
pub const PLAYER_DELETED_KEY: &str = "player.deleted";

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Errors that can occur at the broker boundary.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),
}

/// What to do with a delivery after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
}

/// Ack on logic errors, nack on transient ones. A redelivery only helps
/// when the failure can resolve on its own.
fn disposition_for(result: Result<(), EngineError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(err) if err.is_transient() => {
            error!(error = %err, "Transient failure handling event; requeueing");
            Disposition::Requeue
        }
        Err(err) => {
            warn!(error = %err, "Rejected event");
            Disposition::Ack
        }
    }
}

/// The broker consumer: owns the channel and dispatches decoded events to
/// the engine.
pub struct EventConsumer {
    channel: Channel,
    engine: Arc<RankingEngine>,
}

impl EventConsumer {
    /// Connect (with bounded retry, the broker often comes up after us),
    /// declare the exchanges and the durable queue, and bind the routing
    /// keys.
    pub async fn connect(
        broker_url: &str,
        engine: Arc<RankingEngine>,
    ) -> Result<Self, ConsumerError> {
        let connection = connect_with_retry(broker_url).await?;
        let channel = connection.create_channel().await?;

        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(
                BATTLE_EXCHANGE,
                ExchangeKind::Topic,
                durable_exchange,
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                PLAYER_EXCHANGE,
                ExchangeKind::Topic,
                durable_exchange,
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                RANKING_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                RANKING_QUEUE,
                BATTLE_EXCHANGE,
                BATTLE_COMPLETED_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                RANKING_QUEUE,
                PLAYER_EXCHANGE,
                PLAYER_DELETED_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // One unacked delivery at a time keeps per-queue ordering.
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        info!("Broker connected");
        Ok(Self { channel, engine })
    }

    /// Consume until the delivery channel closes.
    pub async fn run(self) -> Result<(), ConsumerError> {
        let mut deliveries = self
            .channel
            .basic_consume(
                RANKING_QUEUE,
                "ranking-service",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Listening for battle events");
        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;
            let routing_key = delivery.routing_key.as_str().to_string();

            match self.dispatch(&routing_key, &delivery.data).await {
                Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await?,
                Disposition::Requeue => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await?
                }
            }
        }

        info!("Delivery channel closed; consumer stopping");
        Ok(())
    }

    async fn dispatch(&self, routing_key: &str, payload: &[u8]) -> Disposition {
        match routing_key {
            BATTLE_COMPLETED_KEY => {
                let event = match decode_battle_completed(payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "Malformed battle.completed payload; dropping");
                        return Disposition::Ack;
                    }
                };
                info!(
                    battle_id = event.battle_id,
                    winner_id = event.winner_id,
                    loser_id = event.loser_id,
                    "Processing battle outcome"
                );
                disposition_for(
                    self.engine
                        .apply_battle_outcome(
                            event.winner_id,
                            event.loser_id,
                            event.points_won,
                            event.points_lost,
                        )
                        .await,
                )
            }
            PLAYER_DELETED_KEY => {
                let event = match decode_player_deleted(payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "Malformed player.deleted payload; dropping");
                        return Disposition::Ack;
                    }
                };
                info!(player_id = event.player_id, "Processing player deletion");
                disposition_for(self.engine.delete_player_ranking(event.player_id).await)
            }
            other => {
                warn!(routing_key = other, "Unexpected routing key; dropping");
                Disposition::Ack
            }
        }
    }
}

async fn connect_with_retry(broker_url: &str) -> Result<Connection, ConsumerError> {
    let mut attempt = 1;
    loop {
        match Connection::connect(broker_url, ConnectionProperties::default()).await {
            Ok(connection) => return Ok(connection),
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    max = CONNECT_ATTEMPTS,
                    error = %err,
                    "Broker connection failed; retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn decode_battle_completed(payload: &[u8]) -> Result<BattleCompletedEvent, serde_json::Error> {
    serde_json::from_slice(payload)
}

fn decode_player_deleted(payload: &[u8]) -> Result<PlayerDeletedEvent, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexError;

    #[test]
    fn test_decode_battle_completed() {
        let payload = br#"{"battle_id":3,"winner_id":1,"loser_id":2,"points_won":60,"points_lost":25,"timestamp":1722550000}"#;
        let event = decode_battle_completed(payload).unwrap();
        assert_eq!(event.winner_id, 1);
        assert_eq!(event.points_lost, 25);
    }

    #[test]
    fn test_decode_rejects_junk() {
        assert!(decode_battle_completed(b"not json").is_err());
        assert!(decode_battle_completed(br#"{"winner_id":1}"#).is_err());
        assert!(decode_player_deleted(b"{}").is_err());
    }

    #[test]
    fn test_decode_player_deleted_shapes() {
        assert_eq!(decode_player_deleted(br#"{"player_id":7}"#).unwrap().player_id, 7);
        assert_eq!(decode_player_deleted(br#"{"id":7}"#).unwrap().player_id, 7);
    }

    #[test]
    fn test_disposition_policy() {
        assert_eq!(disposition_for(Ok(())), Disposition::Ack);

        // Validation and absence are logic errors: ack, never block the queue.
        assert_eq!(
            disposition_for(Err(EngineError::Validation("bad".into()))),
            Disposition::Ack
        );
        assert_eq!(
            disposition_for(Err(EngineError::NotFound)),
            Disposition::Ack
        );

        // Transient infrastructure failures are worth a redelivery.
        let transient = EngineError::Index(IndexError::Encoding(
            serde_json::from_str::<i64>("x").unwrap_err(),
        ));
        assert_eq!(disposition_for(Err(transient)), Disposition::Requeue);
    }
}
