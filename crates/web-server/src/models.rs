use chrono::{DateTime, Utc};
use database::{Model, UniqueCondition, UniqueModel, Value};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Sequence the subscriber ids are drawn from.
pub const SUBSCRIBER_ID_SEQUENCE: &str = "subscriber_id_seq";

/// A follower of the official account, keyed by its platform `open_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscriber {
    pub id: i64,
    pub open_id: String,
    pub nickname: Option<String>,
    pub city: Option<String>,
    pub subscribed_at: DateTime<Utc>,
}

impl Subscriber {
    /// A subscriber carrying only its key, enough to address it for delete.
    pub fn keyed(open_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            open_id: open_id.into(),
            nickname: None,
            city: None,
            subscribed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Model for Subscriber {
    const TABLE: &'static str = "subscribers";
    const COLUMNS: &'static [&'static str] =
        &["id", "open_id", "nickname", "city", "subscribed_at"];

    fn values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.open_id.clone().into(),
            self.nickname.clone().into(),
            self.city.clone().into(),
            self.subscribed_at.into(),
        ]
    }
}

impl UniqueModel for Subscriber {
    fn unique_condition(&self) -> UniqueCondition {
        UniqueCondition::new("open_id = ?", vec![self.open_id.clone().into()])
    }
}

/// Request body for registering a subscriber.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscriber {
    pub open_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl NewSubscriber {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.open_id.trim().is_empty() {
            return Err(AppError::BadRequest("open_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn into_subscriber(self, id: i64, subscribed_at: DateTime<Utc>) -> Subscriber {
        Subscriber {
            id,
            open_id: self.open_id,
            nickname: self.nickname,
            city: self.city,
            subscribed_at,
        }
    }
}

/// Request body for replacing a subscriber's profile fields.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberProfile {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_follow_column_order() {
        let at = Utc::now();
        let subscriber = NewSubscriber {
            open_id: "o6_bmjrPTlm6".to_string(),
            nickname: Some("lj".to_string()),
            city: None,
        }
        .into_subscriber(42, at);

        let values = subscriber.values();
        assert_eq!(values.len(), Subscriber::COLUMNS.len());
        assert_eq!(values[0], Value::Int(Some(42)));
        assert_eq!(values[3], Value::Text(None));
        assert_eq!(values[4], Value::Timestamp(Some(at)));
    }

    #[test]
    fn blank_open_id_is_rejected() {
        let body = NewSubscriber {
            open_id: "  ".to_string(),
            nickname: None,
            city: None,
        };
        assert!(matches!(body.validate(), Err(AppError::BadRequest(_))));
    }
}
