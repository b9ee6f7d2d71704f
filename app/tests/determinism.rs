//! Property tests: identical block sequences give identical app hashes

mod common;

use chain_modules::NATIVE_DENOM;
use common::*;
use proptest::prelude::*;

/// Transfer from account `from` (0 = alice, 1 = bob) of `amount` with `fee`
#[derive(Debug, Clone)]
struct Transfer {
    from: u8,
    amount: u128,
    fee: u128,
    stale: bool,
}

fn transfer_strategy() -> impl Strategy<Value = Transfer> {
    (0u8..2, 1u128..10_000, 0u128..100, proptest::bool::weighted(0.2)).prop_map(|(from, amount, fee, stale)| {
        Transfer {
            from,
            amount,
            fee,
            stale,
        }
    })
}

fn blocks_strategy() -> impl Strategy<Value = Vec<Vec<Transfer>>> {
    prop::collection::vec(prop::collection::vec(transfer_strategy(), 0..4), 1..4)
}

/// Run `blocks` on a fresh chain, returning every commit hash
fn run(blocks: &[Vec<Transfer>]) -> (Vec<[u8; 32]>, TestChain) {
    let mut chain = TestChain::new();
    let mut hashes = Vec::new();
    for block in blocks {
        chain.begin();
        for transfer in block {
            let (sender, receiver) = if transfer.from == 0 {
                (TestAccount::new(1), chain.bob.address)
            } else {
                (TestAccount::new(2), chain.alice.address)
            };
            // delivered transactions are not yet visible to committed queries
            let sequence = chain.sequence(sender.address);
            let sequence = if transfer.stale { sequence + 5 } else { sequence };
            let tx = chain.transfer_at(&sender, receiver, transfer.amount, transfer.fee, sequence);
            chain.app.deliver_tx(&tx).unwrap();
        }
        hashes.push(chain.end_and_commit());
    }
    (hashes, chain)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_same_blocks_same_hash(blocks in blocks_strategy()) {
        let (first, _) = run(&blocks);
        let (second, _) = run(&blocks);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_transfers_conserve_account_balances(blocks in blocks_strategy()) {
        let (_, mut chain) = run(&blocks);
        let supply = chain.app.keepers().supply.clone();
        let total = chain.app.with_query_context(|ctx| supply.supply(ctx)).unwrap();
        let summed = chain.app.with_query_context(|ctx| supply.sum_of_balances(ctx)).unwrap();
        prop_assert_eq!(total.amount_of(NATIVE_DENOM), summed.amount_of(NATIVE_DENOM));

        let (alice, bob) = (chain.alice.address, chain.bob.address);
        prop_assert!(chain.balance(alice) + chain.balance(bob) <= 2 * INITIAL_BALANCE);
    }
}
