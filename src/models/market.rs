use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The two possible outcomes of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outcome", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(self) -> Outcome {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

/// Lifecycle of a market. Transitions are one-way:
/// `Open -> Closed -> Resolved` or `Open|Closed -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "market_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
    Cancelled,
}

impl MarketStatus {
    pub fn accepts_orders(self) -> bool {
        matches!(self, MarketStatus::Open)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MarketStatus::Resolved | MarketStatus::Cancelled)
    }
}

/// A single binary prediction market.
///
/// `winning_outcome` is populated only once, at resolution, and is the sole
/// source of truth for settlement payouts (C5). It is never changed after
/// being set — resolution is a one-shot admin action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub id: Uuid,
    /// Unique human-readable handle used in the external interface
    /// (`marketSlug`); `id` is the internal join key.
    pub slug: String,
    pub question: String,
    pub status: MarketStatus,
    pub winning_outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub resolve_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMarketRequest {
    pub slug: String,
    pub question: String,
    pub close_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketResponse {
    pub id: Uuid,
    pub slug: String,
    pub question: String,
    pub status: MarketStatus,
    pub winning_outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
}

impl From<Market> for MarketResponse {
    fn from(m: Market) -> Self {
        Self {
            id: m.id,
            slug: m.slug,
            question: m.question,
            status: m.status,
            winning_outcome: m.winning_outcome,
            created_at: m.created_at,
        }
    }
}
