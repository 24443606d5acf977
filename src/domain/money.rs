//! Money arithmetic for deposits, invoice splits and refunds.
//!
//! Amounts are integer cents throughout; the booking invariant
//! `paid + due == total` is maintained by the settlement paths.

/// Deposit policy: 10% of the booking total.
pub const DEPOSIT_PERCENT: i64 = 10;

/// Requested starts further out than this are recorded as pre-orders.
pub const PRE_ORDER_LEAD_DAYS: i64 = 30;

/// Deposit owed for a booking total. Rounds down, never below one cent so a
/// tiny total still produces a chargeable intent.
pub fn deposit_cents(total_cents: i64) -> i64 {
    debug_assert!(total_cents > 0);
    (total_cents * DEPOSIT_PERCENT / 100).max(1)
}

/// How an invoice amount is covered when the customer pays with credit
/// balance, card, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceSplit {
    pub credit_cents: i64,
    pub card_cents: i64,
}

/// Split for method `BOTH`: all available credit first, card for the rest.
/// `None` when the split degenerates (no credit to use, or credit alone covers
/// the invoice); callers should use the single-method path instead.
pub fn split_invoice(due_cents: i64, balance_cents: i64) -> Option<InvoiceSplit> {
    if due_cents <= 0 || balance_cents <= 0 || balance_cents >= due_cents {
        return None;
    }
    Some(InvoiceSplit {
        credit_cents: balance_cents,
        card_cents: due_cents - balance_cents,
    })
}

/// Amount still refundable on a payment given the sum of its prior
/// non-failed refunds.
pub fn remaining_refundable(payment_cents: i64, refunded_cents: i64) -> i64 {
    (payment_cents - refunded_cents).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_is_ten_percent() {
        assert_eq!(deposit_cents(100_000), 10_000);
        assert_eq!(deposit_cents(1_000), 100);
    }

    #[test]
    fn deposit_rounds_down_but_never_to_zero() {
        assert_eq!(deposit_cents(1_999), 199);
        assert_eq!(deposit_cents(9), 1);
        assert_eq!(deposit_cents(1), 1);
    }

    #[test]
    fn split_uses_all_credit_then_card() {
        let split = split_invoice(90_000, 25_000).unwrap();
        assert_eq!(split.credit_cents, 25_000);
        assert_eq!(split.card_cents, 65_000);
        assert_eq!(split.credit_cents + split.card_cents, 90_000);
    }

    #[test]
    fn split_degenerates_without_credit_or_remainder() {
        assert_eq!(split_invoice(90_000, 0), None);
        assert_eq!(split_invoice(90_000, 90_000), None);
        assert_eq!(split_invoice(90_000, 120_000), None);
        assert_eq!(split_invoice(0, 10_000), None);
    }

    #[test]
    fn refundable_never_goes_negative() {
        assert_eq!(remaining_refundable(10_000, 4_000), 6_000);
        assert_eq!(remaining_refundable(10_000, 10_000), 0);
        assert_eq!(remaining_refundable(10_000, 12_000), 0);
    }
}
