//! Booking workflow states and the transition table.
//!
//! Every status-changing handler goes through [`allowed_priors`]: the prior
//! states are compiled into a conditional `UPDATE ... WHERE status IN (...)`,
//! so concurrent callers racing on the same row resolve to exactly one winner.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    PreOrder,
    AwaitingTimeSlot,
    PaymentPending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 9] = [
        BookingStatus::Pending,
        BookingStatus::PreOrder,
        BookingStatus::AwaitingTimeSlot,
        BookingStatus::PaymentPending,
        BookingStatus::Confirmed,
        BookingStatus::Active,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::PreOrder => "PRE_ORDER",
            BookingStatus::AwaitingTimeSlot => "AWAITING_TIME_SLOT",
            BookingStatus::PaymentPending => "PAYMENT_PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Active => "ACTIVE",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Absorbing states; nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected
        )
    }

    /// The booking has been paid for (or its deposit accepted); a settlement
    /// signal arriving now is a duplicate and converges as a no-op.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Active | BookingStatus::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingType {
    Pallet,
    AreaRental,
}

impl BookingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingType::Pallet => "PALLET",
            BookingType::AreaRental => "AREA_RENTAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PALLET" => Some(BookingType::Pallet),
            "AREA_RENTAL" => Some(BookingType::AreaRental),
            _ => None,
        }
    }
}

/// Status-changing actions on a booking. Settlement is listed here too so the
/// reconciliation path uses the same prior-state discipline as human actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SetAwaitingTimeSlot,
    ConfirmTimeSlot,
    Settle,
    Activate,
    Complete,
    Cancel,
    RejectOnBehalf,
}

impl Transition {
    pub fn describe(&self) -> &'static str {
        match self {
            Transition::SetAwaitingTimeSlot => "set awaiting time slot",
            Transition::ConfirmTimeSlot => "confirm time slot",
            Transition::Settle => "settle payment",
            Transition::Activate => "activate",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
            Transition::RejectOnBehalf => "reject on-behalf booking",
        }
    }
}

/// States a transition may start from. The returned slice feeds the
/// `status IN (...)` filter of the conditional update.
pub fn allowed_priors(transition: Transition) -> &'static [BookingStatus] {
    match transition {
        Transition::SetAwaitingTimeSlot => &[BookingStatus::Pending, BookingStatus::PreOrder],
        Transition::ConfirmTimeSlot => &[BookingStatus::AwaitingTimeSlot],
        Transition::Settle => &[BookingStatus::PaymentPending],
        Transition::Activate => &[BookingStatus::Confirmed],
        Transition::Complete => &[BookingStatus::Active],
        Transition::Cancel => &[
            BookingStatus::Pending,
            BookingStatus::PreOrder,
            BookingStatus::AwaitingTimeSlot,
            BookingStatus::PaymentPending,
        ],
        Transition::RejectOnBehalf => &[BookingStatus::Pending, BookingStatus::PreOrder],
    }
}

pub fn target(transition: Transition) -> BookingStatus {
    match transition {
        Transition::SetAwaitingTimeSlot => BookingStatus::AwaitingTimeSlot,
        Transition::ConfirmTimeSlot => BookingStatus::PaymentPending,
        Transition::Settle => BookingStatus::Confirmed,
        Transition::Activate => BookingStatus::Active,
        Transition::Complete => BookingStatus::Completed,
        Transition::Cancel => BookingStatus::Cancelled,
        Transition::RejectOnBehalf => BookingStatus::Rejected,
    }
}

/// Prior states as the strings persisted in the `status` column.
pub fn prior_strs(transition: Transition) -> Vec<&'static str> {
    allowed_priors(transition)
        .iter()
        .map(|s| s.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSITIONS: [Transition; 7] = [
        Transition::SetAwaitingTimeSlot,
        Transition::ConfirmTimeSlot,
        Transition::Settle,
        Transition::Activate,
        Transition::Complete,
        Transition::Cancel,
        Transition::RejectOnBehalf,
    ];

    #[test]
    fn status_strings_round_trip() {
        for status in BookingStatus::ALL {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("SHIPPED"), None);
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        for transition in TRANSITIONS {
            for prior in allowed_priors(transition) {
                assert!(
                    !prior.is_terminal(),
                    "{:?} must not start from terminal {:?}",
                    transition,
                    prior
                );
            }
        }
    }

    #[test]
    fn forward_path_is_monotonic() {
        // pending -> awaiting_time_slot -> payment_pending -> confirmed -> active -> completed
        assert_eq!(
            target(Transition::SetAwaitingTimeSlot),
            BookingStatus::AwaitingTimeSlot
        );
        assert_eq!(
            target(Transition::ConfirmTimeSlot),
            BookingStatus::PaymentPending
        );
        assert_eq!(target(Transition::Settle), BookingStatus::Confirmed);
        assert_eq!(target(Transition::Activate), BookingStatus::Active);
        assert_eq!(target(Transition::Complete), BookingStatus::Completed);
    }

    #[test]
    fn full_state_action_sweep_matches_edge_set() {
        // For every (state, action) pair not in the edge set, the prior filter
        // rejects it; the handler surfaces that as a conflict.
        for transition in TRANSITIONS {
            let priors = allowed_priors(transition);
            for state in BookingStatus::ALL {
                let allowed = priors.contains(&state);
                match (transition, state) {
                    (Transition::Settle, BookingStatus::PaymentPending) => assert!(allowed),
                    (Transition::Settle, _) => assert!(!allowed),
                    (Transition::Cancel, s) if !s.is_terminal() && !s.is_settled() => {
                        assert!(allowed)
                    }
                    (Transition::Cancel, _) => assert!(!allowed),
                    (Transition::ConfirmTimeSlot, BookingStatus::AwaitingTimeSlot) => {
                        assert!(allowed)
                    }
                    (Transition::ConfirmTimeSlot, _) => assert!(!allowed),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn cancel_is_blocked_once_paid() {
        assert!(!allowed_priors(Transition::Cancel).contains(&BookingStatus::Confirmed));
        assert!(!allowed_priors(Transition::Cancel).contains(&BookingStatus::Active));
    }

    #[test]
    fn settled_states_absorb_duplicate_settlements() {
        assert!(BookingStatus::Confirmed.is_settled());
        assert!(BookingStatus::Active.is_settled());
        assert!(BookingStatus::Completed.is_settled());
        assert!(!BookingStatus::PaymentPending.is_settled());
    }
}
