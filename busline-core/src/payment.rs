use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreError;

/// Transaction status as reported by the payment service. Provider-agnostic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Paid,
    Underpaid,
    Expired,
    Cancelled,
    Failed,
}

/// What the booking state machine should do with a transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentAction {
    Confirm,
    Fail,
    /// Persist the payment status only.
    Record,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Paid => "PAID",
            TransactionStatus::Underpaid => "UNDERPAID",
            TransactionStatus::Expired => "EXPIRED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn action(&self) -> PaymentAction {
        match self {
            TransactionStatus::Paid => PaymentAction::Confirm,
            TransactionStatus::Failed | TransactionStatus::Cancelled | TransactionStatus::Expired => {
                PaymentAction::Fail
            }
            TransactionStatus::Pending | TransactionStatus::Processing | TransactionStatus::Underpaid => {
                PaymentAction::Record
            }
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "PAID" => Ok(TransactionStatus::Paid),
            "UNDERPAID" => Ok(TransactionStatus::Underpaid),
            "EXPIRED" => Ok(TransactionStatus::Expired),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(CoreError::ValidationError(format!("unknown transaction status {}", other))),
        }
    }
}

/// The payment service's view of the transaction behind a booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionSnapshot {
    pub booking_id: Uuid,
    pub status: TransactionStatus,
    pub payment_order_id: Option<String>,
}
