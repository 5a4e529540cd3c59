//! Unique identifiers (C7).
//!
//! Every order/trade id is minted with `Uuid::new_v4()`. Lexical ordering of
//! the id is never relied upon for anything except deterministic
//! tie-breaking, where the UUID's string form is compared directly.

use uuid::Uuid;

/// A globally-unique, collision-free identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
