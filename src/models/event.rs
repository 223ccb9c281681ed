//! Wire models: broker event payloads and upstream service DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `battle.completed` payload from the battle service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleCompletedEvent {
    pub battle_id: i64,
    pub winner_id: i64,
    pub loser_id: i64,
    pub points_won: i32,
    pub points_lost: i32,
    pub timestamp: u64,
}

/// `player.deleted` payload from the player service. Older producers send
/// the identifier as `id`, newer ones as `player_id`; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDeletedEvent {
    #[serde(alias = "id")]
    pub player_id: i64,
}

/// Internal pub/sub payload published after every accepted power change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerUpdateEvent {
    pub player_id: i64,
    pub username: String,
    pub combat_power: i64,
    pub points_delta: i32,
    pub is_win: bool,
    pub timestamp: DateTime<Utc>,
}

/// Authoritative player state from the player service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub username: String,
    pub points: i32,
}

/// A historical battle from the battle service, used only during bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battle {
    pub id: i64,
    pub player1_id: i64,
    pub player2_id: i64,
    #[serde(default)]
    pub winner_id: i64,
    pub status: String,
    #[serde(default)]
    pub points_won: i32,
    #[serde(default)]
    pub points_lost: i32,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Battle {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// The non-winner participant, when the winner is one of the two.
    pub fn loser_id(&self) -> Option<i64> {
        if self.winner_id == self.player1_id {
            Some(self.player2_id)
        } else if self.winner_id == self.player2_id {
            Some(self.player1_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battle_completed_decode() {
        let raw = r#"{"battle_id":9,"winner_id":1,"loser_id":2,"points_won":60,"points_lost":25,"timestamp":1722550000}"#;
        let event: BattleCompletedEvent = serde_json::from_str(raw).unwrap();

        assert_eq!(event.winner_id, 1);
        assert_eq!(event.loser_id, 2);
        assert_eq!(event.points_won, 60);
        assert_eq!(event.points_lost, 25);
    }

    #[test]
    fn test_battle_completed_missing_field_rejected() {
        let raw = r#"{"battle_id":9,"winner_id":1,"points_won":60}"#;
        assert!(serde_json::from_str::<BattleCompletedEvent>(raw).is_err());
    }

    #[test]
    fn test_player_deleted_accepts_both_shapes() {
        let event: PlayerDeletedEvent = serde_json::from_str(r#"{"player_id":7}"#).unwrap();
        assert_eq!(event.player_id, 7);

        let event: PlayerDeletedEvent = serde_json::from_str(r#"{"id":7}"#).unwrap();
        assert_eq!(event.player_id, 7);
    }

    #[test]
    fn test_battle_loser_id() {
        let battle = Battle {
            id: 1,
            player1_id: 10,
            player2_id: 20,
            winner_id: 20,
            status: "completed".into(),
            points_won: 50,
            points_lost: 30,
            completed_at: None,
        };

        assert!(battle.is_completed());
        assert_eq!(battle.loser_id(), Some(10));
    }

    #[test]
    fn test_battle_unknown_winner_has_no_loser() {
        let battle = Battle {
            id: 1,
            player1_id: 10,
            player2_id: 20,
            winner_id: 0,
            status: "pending".into(),
            points_won: 0,
            points_lost: 0,
            completed_at: None,
        };

        assert!(!battle.is_completed());
        assert_eq!(battle.loser_id(), None);
    }
}
