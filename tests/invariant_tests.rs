//! Chain-wide invariants checked over a populated database

mod common;

use chain_core::codec::{block_hash, transactions_merkle_root};
use chain_core::mining::create_block_template;
use chain_core::pow::{check_proof_of_work, target_for_height};
use chain_core::*;
use common::*;
use std::collections::HashSet;

/// Three blocks: a coinbase, a transfer with change, a transfer of the change
fn populated() -> (ChainCore<MemoryStore>, Account, Account) {
    let a1 = account(1);
    let a2 = account(2);
    let core = core_for(&a1);
    let first = core.mine_once(&CancellationToken::new()).unwrap();

    let outputs = vec![(a2.address(), 30), (a1.address(), 15)];
    let transfer = spend(&a1, vec![coinbase_outpoint(&first)], outputs);
    core.submit(transfer.clone()).unwrap();
    core.mine_once(&CancellationToken::new()).unwrap();

    let change = OutPoint { tx_hash: transfer.hash, index: 1 };
    core.submit(spend(&a1, vec![change], vec![(a2.address(), 15)])).unwrap();
    core.mine_once(&CancellationToken::new()).unwrap();
    (core, a1, a2)
}

fn assert_address_index_consistent(core: &ChainCore<MemoryStore>, address: &str) {
    let outputs = core.outputs_by_address(address, 0, 100).unwrap();
    let unspent: Vec<AddressOutput> = outputs
        .into_iter()
        .filter(|o| core.database().utxo(&o.outpoint).unwrap().is_some())
        .collect();
    let utxos = core.utxos_by_address(address, 0, 100).unwrap();
    assert_eq!(utxos, unspent);
    assert!(utxos.iter().all(|u| u.spent_by.is_none()));
}

#[test]
fn test_committed_blocks_are_linked_and_solved() {
    let (core, _, _) = populated();
    let blocks = chain_of(&core);
    let view = core.database().read();
    let mut previous = core.config().genesis_hash;
    for block in blocks {
        assert_eq!(block.hash, block_hash(&block));
        assert_eq!(block.merkle_root, transactions_merkle_root(&block.transactions));
        assert_eq!(block.previous_block_hash, previous);
        let target = target_for_height(core.config(), &view, block.height).unwrap();
        assert!(check_proof_of_work(&block.hash, &target));
        previous = block.hash;
    }
}

#[test]
fn test_committed_transactions_balance() {
    let (core, _, _) = populated();
    for record in core.transactions_by_sequence(0, 100).unwrap() {
        let tx = &record.transaction;
        if tx.transaction_type == TransactionType::Coinbase {
            continue;
        }
        let inputs: Value = tx
            .inputs
            .iter()
            .map(|i| {
                let origin = core.transaction_by_hash(&i.prevout.tx_hash).unwrap().unwrap();
                origin.transaction.outputs[i.prevout.index as usize].value
            })
            .sum();
        let outputs: Value = tx.outputs.iter().map(|o| o.value).sum();
        assert!(outputs <= inputs);
    }
}

#[test]
fn test_utxo_set_tracks_unspent_outputs() {
    let (core, _, _) = populated();
    let records = core.transactions_by_sequence(0, 100).unwrap();
    let spent: HashSet<OutPoint> = records
        .iter()
        .flat_map(|r| r.transaction.inputs.iter().map(|i| i.prevout.clone()))
        .collect();

    for record in &records {
        for index in 0..record.transaction.outputs.len() as u64 {
            let outpoint = OutPoint { tx_hash: record.transaction.hash, index };
            let present = core.database().utxo(&outpoint).unwrap().is_some();
            assert_eq!(present, !spent.contains(&outpoint), "{}", outpoint);
        }
    }
}

#[test]
fn test_address_index_consistency() {
    let (core, a1, a2) = populated();
    assert_address_index_consistent(&core, &a1.address());
    assert_address_index_consistent(&core, &a2.address());
    assert_eq!(core.balance(&a2.address()).unwrap(), 45);

    core.rollback_to(2).unwrap();
    assert_address_index_consistent(&core, &a1.address());
    assert_address_index_consistent(&core, &a2.address());
    assert_eq!(core.balance(&a2.address()).unwrap(), 30);
}

#[test]
fn test_tail_moves_one_block_per_event() {
    let core = core_for(&account(1));
    let events = core.subscribe();
    mine(&core, 3);
    core.rollback_to(0).unwrap();

    let heights: Vec<(bool, Height)> = events
        .try_iter()
        .map(|e| (matches!(e, ChainEvent::Added(_)), e.block().height))
        .collect();
    assert_eq!(heights, vec![(true, 1), (true, 2), (true, 3), (false, 3), (false, 2), (false, 1)]);
}

#[test]
fn test_rollback_round_trip_empties_everything() {
    let (core, a1, a2) = populated();
    core.rollback_to(0).unwrap();
    assert!(core.database().store().is_empty());
    assert!(core.utxos_by_address(&a1.address(), 0, 10).unwrap().is_empty());
    assert!(core.utxos_by_address(&a2.address(), 0, 10).unwrap().is_empty());

    // the chain can be rebuilt from scratch afterwards
    mine(&core, 1);
    assert_eq!(core.height(), 1);
}

#[test]
fn test_resubmission_and_reappend_are_noops() {
    let a1 = account(1);
    let core = core_for(&a1);
    let first = core.mine_once(&CancellationToken::new()).unwrap();

    let tx = spend(&a1, vec![coinbase_outpoint(&first)], vec![("a2".into(), 10)]);
    core.submit(tx.clone()).unwrap();
    assert_eq!(core.submit(tx).unwrap(), Admission::AlreadyPresent);
    assert_eq!(core.mempool().len(), 1);

    assert!(matches!(core.append_block(&first), Err(ConsensusError::Linkage(_))));
    assert_eq!(core.height(), 1);
}

#[test]
fn test_candidates_are_deterministic() {
    let a1 = account(1);
    let core = core_for(&a1);
    let first = core.mine_once(&CancellationToken::new()).unwrap();
    let tx = spend(&a1, vec![coinbase_outpoint(&first)], vec![("a2".into(), 10)]);

    let left = Mempool::new(core.config().clone());
    let right = Mempool::new(core.config().clone());
    let view = core.database().read();
    let now = first.timestamp + 1;
    left.submit(tx.clone(), &view, tx.timestamp).unwrap();
    right.submit(tx.clone(), &view, tx.timestamp).unwrap();

    let a = create_block_template(&view, &left, core.config(), "m", now).unwrap();
    let b = create_block_template(&view, &right, core.config(), "m", now).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.block.transactions.len(), 2);
}
