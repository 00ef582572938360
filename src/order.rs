//! Order records and deterministic order identifiers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Literal tag every order id starts with.
pub const ORDER_ID_TAG: &str = "FS";

/// The (user, product, sale) triple an order is unique for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub user_id: u64,
    pub product_id: u64,
    pub sale_id: u64,
}

impl OrderKey {
    pub fn new(user_id: u64, product_id: u64, sale_id: u64) -> Self {
        Self { user_id, product_id, sale_id }
    }

    /// SHA-256 of the canonical form `order:{user}:{product}:{sale}`.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "order:{}:{}:{}", self.user_id, self.product_id, self.sale_id)
    }
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 3] =
        [OrderStatus::Pending, OrderStatus::Completed, OrderStatus::Cancelled];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string outside the fixed set.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown order status '{0}'")]
pub struct InvalidStatus(pub String);

impl FromStr for OrderStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidStatus(s.to_string()))
    }
}

/// One row of the order table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub user_id: u64,
    pub product_id: u64,
    pub sale_id: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Fresh `PENDING` row for `key`.
    pub fn pending(order_id: String, key: OrderKey, created_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            user_id: key.user_id,
            product_id: key.product_id,
            sale_id: key.sale_id,
            status: OrderStatus::Pending,
            created_at,
        }
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.user_id, self.product_id, self.sale_id)
    }
}

/// Triple-derived part of an order id: the tag plus eight alphanumerics of the key digest.
///
/// The digest is base64url-encoded without padding, stripped of `-`/`_`, and
/// the window `[2, 10)` is kept.
pub fn order_id_prefix(key: &OrderKey) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(key.digest());
    let window: String =
        encoded.chars().filter(char::is_ascii_alphanumeric).skip(2).take(8).collect();
    format!("{}{}", ORDER_ID_TAG, window)
}

/// Full order id: `FS<8 chars>-<YYYYMMDDHHMMSSmmm>`.
///
/// Successive attempts for the same key share the prefix and differ in the
/// millisecond suffix. Uniqueness of stored rows is enforced by the ledger,
/// not by this format.
pub fn generate_order_id(key: &OrderKey, at: DateTime<Utc>) -> String {
    format!("{}-{}", order_id_prefix(key), at.format("%Y%m%d%H%M%S%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_canonical_form() {
        assert_eq!(OrderKey::new(1, 2, 3).to_string(), "order:1:2:3");
    }

    #[test]
    fn prefix_is_stable_for_a_key() {
        assert_eq!(order_id_prefix(&OrderKey::new(1, 2, 3)), "FSug99M4Ix");
        assert_eq!(order_id_prefix(&OrderKey::new(7, 3, 9)), "FSEEWBeA5N");
    }

    #[test]
    fn id_embeds_millisecond_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap()
            + chrono::Duration::milliseconds(7);
        assert_eq!(generate_order_id(&OrderKey::new(1, 2, 3), at), "FSug99M4Ix-20261016093000007");
    }

    #[test]
    fn ids_for_same_key_differ_by_time_only() {
        let key = OrderKey::new(5, 5, 5);
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = generate_order_id(&key, t);
        let b = generate_order_id(&key, t + chrono::Duration::milliseconds(1));
        assert_ne!(a, b);
        assert_eq!(a[..10], b[..10]);
        assert_eq!(a.len(), 10 + 1 + 17);
    }

    #[test]
    fn status_parsing_is_exact() {
        assert_eq!("PENDING".parse::<OrderStatus>(), Ok(OrderStatus::Pending));
        assert_eq!("CANCELLED".parse::<OrderStatus>(), Ok(OrderStatus::Cancelled));
        assert_eq!("pending".parse::<OrderStatus>(), Err(InvalidStatus("pending".into())));
        assert!("BOGUS".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&OrderStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }
}
