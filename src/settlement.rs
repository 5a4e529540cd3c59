//! C5 Settlement: administrative resolution and cancellation of a market.
//!
//! Resolution pays winning shares 1/unit and zeroes losing shares;
//! cancellation refunds every position at its cost basis, both inside
//! one transaction. The per-user settlement loop itself lives in
//! [`crate::escrow::Ledger`] (`resolve_market`/`cancel_market`) since it
//! needs the same row-locked transaction as order submission; this module
//! is the orchestration layer that owns the Market status transition and
//! fans the result out over the [`EventBus`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{AppError, ErrorCode};
use crate::escrow::{EscrowError, Ledger, SettlementCommit};
use crate::eventbus::EventBus;
use crate::models::market::{MarketStatus, Outcome};

#[derive(Debug, thiserror::Error)]
pub enum MarketRepositoryError {
    #[error("market not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Just enough of Market persistence for the admin lifecycle operations:
/// OPEN → CLOSED → RESOLVED, OPEN → CANCELLED, CLOSED → CANCELLED. Market
/// creation/closing sit on the admin-UX side, out of scope here; this
/// crate only needs to read and advance status for
/// `resolveMarket`/`cancelMarket`.
#[async_trait]
pub trait MarketRepository: Send + Sync {
    async fn status(&self, market_id: Uuid) -> Result<MarketStatus, MarketRepositoryError>;
    async fn mark_resolved(&self, market_id: Uuid, outcome: Outcome) -> Result<(), MarketRepositoryError>;
    async fn mark_cancelled(&self, market_id: Uuid) -> Result<(), MarketRepositoryError>;
}

#[derive(Default)]
pub struct InMemoryMarketRepository {
    statuses: Mutex<HashMap<Uuid, MarketStatus>>,
}

impl InMemoryMarketRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, market_id: Uuid, status: MarketStatus) {
        self.statuses.lock().insert(market_id, status);
    }
}

#[async_trait]
impl MarketRepository for InMemoryMarketRepository {
    async fn status(&self, market_id: Uuid) -> Result<MarketStatus, MarketRepositoryError> {
        self.statuses
            .lock()
            .get(&market_id)
            .copied()
            .ok_or(MarketRepositoryError::NotFound)
    }

    async fn mark_resolved(&self, market_id: Uuid, _outcome: Outcome) -> Result<(), MarketRepositoryError> {
        let mut statuses = self.statuses.lock();
        let entry = statuses.get_mut(&market_id).ok_or(MarketRepositoryError::NotFound)?;
        *entry = MarketStatus::Resolved;
        Ok(())
    }

    async fn mark_cancelled(&self, market_id: Uuid) -> Result<(), MarketRepositoryError> {
        let mut statuses = self.statuses.lock();
        let entry = statuses.get_mut(&market_id).ok_or(MarketRepositoryError::NotFound)?;
        *entry = MarketStatus::Cancelled;
        Ok(())
    }
}

pub struct SqlxMarketRepository {
    pool: PgPool,
}

impl SqlxMarketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarketRepository for SqlxMarketRepository {
    async fn status(&self, market_id: Uuid) -> Result<MarketStatus, MarketRepositoryError> {
        let row: Option<(MarketStatus,)> = sqlx::query_as("SELECT status FROM markets WHERE id = $1")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(status,)| status).ok_or(MarketRepositoryError::NotFound)
    }

    async fn mark_resolved(&self, market_id: Uuid, outcome: Outcome) -> Result<(), MarketRepositoryError> {
        let result = sqlx::query(
            "UPDATE markets SET status = 'resolved', winning_outcome = $2, resolve_time = $3 WHERE id = $1",
        )
        .bind(market_id)
        .bind(outcome)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MarketRepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_cancelled(&self, market_id: Uuid) -> Result<(), MarketRepositoryError> {
        let result = sqlx::query("UPDATE markets SET status = 'cancelled' WHERE id = $1")
            .bind(market_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MarketRepositoryError::NotFound);
        }
        Ok(())
    }
}

impl From<MarketRepositoryError> for AppError {
    fn from(err: MarketRepositoryError) -> Self {
        match err {
            MarketRepositoryError::NotFound => AppError::new(ErrorCode::NotFound, "market not found"),
            MarketRepositoryError::Database(e) => AppError::new(ErrorCode::Internal, e.to_string()),
        }
    }
}

/// Outcome of an admin settlement call, matching the
/// `{settledPositions, totalPayout}` / `{refunded}` response shapes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SettlementOutcome {
    pub settled: Vec<crate::escrow::SettledPosition>,
    pub total_payout: rust_decimal::Decimal,
}

pub struct SettlementService {
    markets: Arc<dyn MarketRepository>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
}

impl SettlementService {
    pub fn new(markets: Arc<dyn MarketRepository>, ledger: Arc<dyn Ledger>, events: Arc<EventBus>) -> Self {
        Self { markets, ledger, events }
    }

    /// `resolveMarket`: requires CLOSED, transitions to RESOLVED, pays
    /// out every winning position at 1/share.
    pub async fn resolve_market(&self, market_id: Uuid, outcome: Outcome) -> Result<SettlementOutcome, AppError> {
        let status = self.markets.status(market_id).await?;
        match status {
            MarketStatus::Closed => {}
            MarketStatus::Resolved => return Err(AppError::new(ErrorCode::AlreadyResolved, "market already resolved")),
            _ => return Err(AppError::new(ErrorCode::NotClosed, "market is not closed")),
        }

        let commit = self
            .ledger
            .resolve_market(market_id, outcome)
            .await
            .map_err(escrow_error_to_app)?;
        self.markets.mark_resolved(market_id, outcome).await?;

        self.publish_settlement(market_id, &commit, MarketStatus::Resolved, Some(outcome)).await;

        Ok(SettlementOutcome {
            settled: commit.settled,
            total_payout: commit.total_payout,
        })
    }

    /// `cancelMarket`: requires OPEN or CLOSED, refunds every position at
    /// its cost basis and releases open-order escrow.
    pub async fn cancel_market(&self, market_id: Uuid) -> Result<SettlementOutcome, AppError> {
        let status = self.markets.status(market_id).await?;
        if status.is_terminal() {
            return Err(AppError::new(ErrorCode::NotOpenOrClosed, "market already terminal"));
        }

        let commit = self
            .ledger
            .cancel_market(market_id)
            .await
            .map_err(escrow_error_to_app)?;
        self.markets.mark_cancelled(market_id).await?;

        self.publish_settlement(market_id, &commit, MarketStatus::Cancelled, None).await;

        Ok(SettlementOutcome {
            settled: commit.settled,
            total_payout: commit.total_payout,
        })
    }

    async fn publish_settlement(
        &self,
        market_id: Uuid,
        commit: &SettlementCommit,
        status: MarketStatus,
        winning_outcome: Option<Outcome>,
    ) {
        self.events
            .publish(
                format!("market:{market_id}"),
                "market_updated",
                serde_json::json!({ "marketId": market_id, "status": status, "outcome": winning_outcome }),
            )
            .await;

        for settled in &commit.settled {
            self.events
                .publish(
                    format!("user:{}", settled.user_id),
                    "position_updated",
                    serde_json::json!({
                        "marketId": market_id,
                        "outcome": settled.outcome,
                        "payout": settled.payout,
                        "won": settled.won,
                    }),
                )
                .await;
        }

        tracing::info!(
            market_id = %market_id,
            status = ?status,
            total_payout = %commit.total_payout,
            "market settlement complete"
        );
    }
}

fn escrow_error_to_app(err: EscrowError) -> AppError {
    AppError::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::InMemoryLedger;
    use crate::models::market::MarketStatus;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn resolve_market_requires_closed_status() {
        let markets = Arc::new(InMemoryMarketRepository::new());
        let market_id = Uuid::new_v4();
        markets.seed(market_id, MarketStatus::Open);
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(EventBus::new());
        let service = SettlementService::new(markets, ledger, events);

        let err = service.resolve_market(market_id, Outcome::Yes).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotClosed);
    }

    #[tokio::test]
    async fn scenario_e_resolution_pays_winners_only() {
        let market_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let markets = Arc::new(InMemoryMarketRepository::new());
        markets.seed(market_id, MarketStatus::Closed);

        let ledger = Arc::new(InMemoryLedger::new());
        ledger.seed_position(alice, market_id, Outcome::Yes, dec!(10), dec!(0.60));
        ledger.seed_position(bob, market_id, Outcome::No, dec!(10), dec!(0.40));

        let events = Arc::new(EventBus::new());
        let mut market_rx = events.subscribe(format!("market:{market_id}"));
        let mut alice_rx = events.subscribe(format!("user:{alice}"));

        let service = SettlementService::new(markets, ledger.clone(), events);
        let outcome = service.resolve_market(market_id, Outcome::Yes).await.unwrap();

        assert_eq!(outcome.total_payout, dec!(10));
        let alice_balance = ledger.get_balance(alice).await.unwrap();
        assert_eq!(alice_balance.available, dec!(10));
        let bob_balance = ledger.get_balance(bob).await.unwrap();
        assert_eq!(bob_balance.available, dec!(0));

        let alice_position = ledger.get_position(alice, market_id, Outcome::Yes).await.unwrap();
        assert!(alice_position.is_empty());

        assert_eq!(market_rx.recv().await.unwrap().event_type, "market_updated");
        assert_eq!(alice_rx.recv().await.unwrap().event_type, "position_updated");
    }
}
