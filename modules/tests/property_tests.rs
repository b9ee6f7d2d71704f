//! Property-based tests for coin arithmetic
//!
//! - Adding then subtracting the same coins is the identity
//! - Subtraction never goes negative
//! - Truncation splits a decimal amount without losing value

use chain_modules::{types::dec_from_amount, Coin, Coins, DecCoins};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn denom_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["aphoton", "stake", "uatom"]).prop_map(String::from)
}

fn coins_strategy() -> impl Strategy<Value = Coins> {
    prop::collection::vec((denom_strategy(), 0u128..1_000_000_000_000), 0..4).prop_map(|entries| {
        let mut merged: Vec<Coin> = Vec::new();
        for (denom, amount) in entries {
            match merged.iter_mut().find(|c| c.denom == denom) {
                Some(existing) => existing.amount += amount,
                None => merged.push(Coin::new(amount, denom)),
            }
        }
        Coins::new(merged).unwrap()
    })
}

proptest! {
    #[test]
    fn prop_add_then_sub_is_identity(a in coins_strategy(), b in coins_strategy()) {
        let sum = a.checked_add(&b).unwrap();
        prop_assert!(sum.validate().is_ok());
        prop_assert!(sum.is_all_gte(&a));
        prop_assert!(sum.is_all_gte(&b));
        prop_assert_eq!(sum.checked_sub(&b).unwrap(), a);
    }

    #[test]
    fn prop_sub_never_negative(a in coins_strategy(), b in coins_strategy()) {
        match a.checked_sub(&b) {
            Some(diff) => {
                prop_assert!(a.is_all_gte(&b));
                prop_assert!(diff.validate().is_ok());
            }
            None => prop_assert!(!a.is_all_gte(&b)),
        }
    }

    #[test]
    fn prop_truncate_preserves_value(coins in coins_strategy(), divisor in 1u32..1000) {
        let dec = DecCoins::from_coins(&coins).unwrap().quo_dec(Decimal::from(divisor)).unwrap();
        let (whole, change) = dec.truncate();
        for (denom, amount) in dec.iter() {
            let rebuilt = dec_from_amount(whole.amount_of(denom)).unwrap() + change.amount_of(denom);
            prop_assert_eq!(rebuilt, *amount);
            prop_assert!(change.amount_of(denom) < Decimal::ONE);
        }
    }
}
