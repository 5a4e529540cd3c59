//! C4 OrderGateway: validates submissions and enforces idempotency before
//! anything reaches the Engine.
//!
//! Request-facing validation generalized to this crate's transport-neutral
//! boundary: the gateway never sees HTTP, it only validates a
//! fully-deserialized [`PlaceOrderRequest`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::PredexConfig;
use crate::errors::{AppError, ErrorCode};
use crate::models::order::{OrderType, PlaceOrderRequest, Side};

/// A cached result of a prior submission, keyed by `(userId, idempotencyKey)`.
/// Stored long enough to answer an exact replay without re-entering the
/// Engine.
#[derive(Clone)]
struct CachedSubmission {
    request_fingerprint: u64,
    result: Result<crate::market_actor::PlaceOrderOutcome, AppError>,
    recorded_at: Instant,
}

/// Validation plus idempotency-key deduplication ahead of the per-market
/// actor. Stateless with respect to markets — one `OrderGateway` instance
/// serves every market in the process.
pub struct OrderGateway {
    config: PredexConfig,
    idempotency: DashMap<(Uuid, String), CachedSubmission>,
}

impl OrderGateway {
    pub fn new(config: PredexConfig) -> Self {
        Self {
            config,
            idempotency: DashMap::new(),
        }
    }

    /// Logical well-formedness checks independent of transport: price in
    /// tick units, quantity bounds, outcome/side/type enumerations (already
    /// enforced by the type system here).
    pub fn validate(&self, request: &PlaceOrderRequest) -> Result<(), AppError> {
        if request.quantity < self.config.min_quantity || request.quantity > self.config.max_quantity {
            return Err(AppError::new(
                ErrorCode::QuantityOutOfRange,
                format!(
                    "quantity {} outside [{}, {}]",
                    request.quantity, self.config.min_quantity, self.config.max_quantity
                ),
            ));
        }

        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    AppError::new(ErrorCode::PriceOutOfRange, "LIMIT orders require a price")
                })?;
                if price <= Decimal::ZERO || price >= Decimal::ONE {
                    return Err(AppError::new(
                        ErrorCode::PriceOutOfRange,
                        "price must lie strictly within (0, 1)",
                    ));
                }
                if !is_on_tick(price, self.config.tick_size) {
                    return Err(AppError::new(
                        ErrorCode::PriceOutOfRange,
                        format!("price {} is not a multiple of tick size {}", price, self.config.tick_size),
                    ));
                }
            }
            OrderType::Market => {
                if request.price.is_some() {
                    return Err(AppError::new(
                        ErrorCode::PriceOutOfRange,
                        "MARKET orders must not carry a price",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Looks up a prior result for `(userId, idempotencyKey)`. `Some(Ok(_))`
    /// or `Some(Err(_))` means the caller should return the cached result
    /// without re-entering the Engine; `Err` specifically signals a body
    /// mismatch (`IDEMPOTENCY_KEY_CONFLICT`).
    pub fn check_idempotency(
        &self,
        user_id: Uuid,
        request: &PlaceOrderRequest,
    ) -> Option<Result<crate::market_actor::PlaceOrderOutcome, AppError>> {
        let key = (user_id, request.idempotency_key.clone());
        let cached = self.idempotency.get(&key)?;
        if cached.recorded_at.elapsed() > Duration::from_secs(self.config.idempotency_ttl_secs) {
            return None;
        }
        if cached.request_fingerprint != fingerprint(request) {
            return Some(Err(AppError::new(
                ErrorCode::IdempotencyKeyConflict,
                "idempotency key reused with a different request body",
            )));
        }
        Some(cached.result.clone())
    }

    pub fn record_result(
        &self,
        user_id: Uuid,
        request: &PlaceOrderRequest,
        result: Result<crate::market_actor::PlaceOrderOutcome, AppError>,
    ) {
        let key = (user_id, request.idempotency_key.clone());
        self.idempotency.insert(
            key,
            CachedSubmission {
                request_fingerprint: fingerprint(request),
                result,
                recorded_at: Instant::now(),
            },
        );
    }
}

fn is_on_tick(price: Decimal, tick: Decimal) -> bool {
    if tick.is_zero() {
        return true;
    }
    (price / tick).fract().is_zero()
}

fn fingerprint(request: &PlaceOrderRequest) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request.market_id.hash(&mut hasher);
    format!("{:?}", request.outcome).hash(&mut hasher);
    format!("{:?}", request.side).hash(&mut hasher);
    format!("{:?}", request.order_type).hash(&mut hasher);
    request.price.map(|p| p.to_string()).hash(&mut hasher);
    request.quantity.to_string().hash(&mut hasher);
    hasher.finish()
}

impl std::fmt::Debug for OrderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderGateway")
            .field("cached_submissions", &self.idempotency.len())
            .finish()
    }
}

pub type SharedOrderGateway = Arc<OrderGateway>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::market::Outcome;
    use rust_decimal_macros::dec;

    fn request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            market_id: Uuid::new_v4(),
            outcome: Outcome::Yes,
            side: Side::Buy,
            order_type: OrderType::Limit,
            time_in_force: Default::default(),
            price: Some(dec!(0.65)),
            quantity: dec!(4),
            idempotency_key: "k1".into(),
        }
    }

    #[test]
    fn rejects_price_off_tick_grid() {
        let gateway = OrderGateway::new(PredexConfig::default());
        let mut req = request();
        req.price = Some(dec!(0.651));
        assert!(matches!(
            gateway.validate(&req),
            Err(AppError { code: ErrorCode::PriceOutOfRange, .. })
        ));
    }

    #[test]
    fn rejects_quantity_below_minimum() {
        let gateway = OrderGateway::new(PredexConfig::default());
        let mut req = request();
        req.quantity = dec!(0.001);
        assert!(matches!(
            gateway.validate(&req),
            Err(AppError { code: ErrorCode::QuantityOutOfRange, .. })
        ));
    }

    #[test]
    fn accepts_well_formed_limit_order() {
        let gateway = OrderGateway::new(PredexConfig::default());
        assert!(gateway.validate(&request()).is_ok());
    }
}
