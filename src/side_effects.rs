//! Derived-state resolvers for stock and credit balances.
//!
//! Each resolver is a pure `(tracked, amount) -> new` function. The same
//! function runs once against the mirror when a mutation is enqueued and once
//! against the remote row when the outbox entry drains.

use crate::ids::EntityId;
use crate::models::{CreditStatus, Sale};

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// New stock after removing `amount`. Floored at zero: concurrent edits are
/// last-writer-wins and there is no distributed lock to prevent overselling.
pub fn decrement_stock(tracked: f64, amount: f64) -> f64 {
    round2((tracked - amount).max(0.0))
}

/// Quantity of a linked product consumed by a sold line.
pub fn linked_quantity(line_quantity: f64, quantity_per_unit: f64) -> f64 {
    round2(line_quantity * quantity_per_unit)
}

/// Credit balance after a payment. Overpayments settle the credit at zero.
pub fn apply_credit_payment(balance: f64, amount: f64) -> f64 {
    round2((balance - amount).max(0.0))
}

pub fn credit_status(balance: f64) -> CreditStatus {
    if balance <= 0.0 {
        CreditStatus::Paid
    } else {
        CreditStatus::Open
    }
}

/// A single stock decrement produced by a sale.
#[derive(Debug, Clone, PartialEq)]
pub struct StockStep {
    pub product_id: EntityId,
    pub amount: f64,
}

/// Ordered stock decrements for a sale: each stock-tracked line, followed by
/// the line's linked products.
///
/// The order is stable so a drain interrupted after step `n` can resume at
/// `n + 1` without repeating a remote write.
pub fn stock_plan(sale: &Sale) -> Vec<StockStep> {
    let mut steps = Vec::new();
    for item in &sale.items {
        if item.tracks_stock {
            steps.push(StockStep {
                product_id: item.product_id.clone(),
                amount: item.quantity,
            });
        }
        for linked in &item.linked {
            let amount = linked_quantity(item.quantity, linked.quantity_per_unit);
            if amount > 0.0 {
                steps.push(StockStep {
                    product_id: linked.product_id.clone(),
                    amount,
                });
            }
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinkedProduct, PaymentMethod, SaleItem};

    #[test]
    fn stock_never_goes_negative() {
        let after_first = decrement_stock(1.0, 1.0);
        let after_second = decrement_stock(after_first, 1.0);
        assert_eq!(after_first, 0.0);
        assert_eq!(after_second, 0.0);
    }

    #[test]
    fn linked_quantity_rounds_to_cents() {
        assert_eq!(linked_quantity(3.0, 0.333), 1.0);
        assert_eq!(linked_quantity(2.0, 0.125), 0.25);
        assert_eq!(decrement_stock(10.0, linked_quantity(3.0, 0.333)), 9.0);
    }

    #[test]
    fn credit_payment_settles_at_zero() {
        assert_eq!(apply_credit_payment(100.0, 40.0), 60.0);
        assert_eq!(apply_credit_payment(60.0, 75.0), 0.0);
        assert_eq!(credit_status(0.0), CreditStatus::Paid);
        assert_eq!(credit_status(0.01), CreditStatus::Open);
    }

    #[test]
    fn stock_plan_skips_untracked_lines_but_keeps_linked() {
        let sale = Sale {
            client_id: None,
            items: vec![
                SaleItem {
                    product_id: EntityId::Authoritative(1),
                    quantity: 3.0,
                    unit_price: 5.0,
                    tracks_stock: false,
                    linked: vec![LinkedProduct {
                        product_id: EntityId::Authoritative(2),
                        quantity_per_unit: 0.333,
                    }],
                },
                SaleItem {
                    product_id: EntityId::Authoritative(3),
                    quantity: 1.0,
                    unit_price: 2.0,
                    tracks_stock: true,
                    linked: Vec::new(),
                },
            ],
            total: 17.0,
            payment_method: PaymentMethod::Cash,
            sold_at: "2026-10-19T10:00:00Z".into(),
        };

        let plan = stock_plan(&sale);
        assert_eq!(
            plan,
            vec![
                StockStep {
                    product_id: EntityId::Authoritative(2),
                    amount: 1.0
                },
                StockStep {
                    product_id: EntityId::Authoritative(3),
                    amount: 1.0
                },
            ]
        );
    }
}
