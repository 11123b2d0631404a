//! Synchronization against a peer: adoption, restore, ties and the worker

mod common;

use chain_core::worker::current_timestamp;
use chain_core::*;
use common::*;
use crossbeam::channel::bounded;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_tie_keeps_local_chain() {
    let local = core_for(&account(1));
    let tail = mine(&local, 2)[1].hash;

    let peer = core_for(&account(9));
    local.attach_peer(VecPeer::new(mine(&peer, 2)));

    assert_eq!(local.synchronize(&CancellationToken::new()).unwrap(), SyncOutcome::UpToDate);
    assert_eq!(local.tail().unwrap().hash, tail);
}

#[test]
fn test_empty_peer_is_up_to_date() {
    let local = core_for(&account(1));
    mine(&local, 1);
    local.attach_peer(VecPeer::new(vec![]));
    assert_eq!(local.synchronize(&CancellationToken::new()).unwrap(), SyncOutcome::UpToDate);
}

#[test]
fn test_adopts_from_common_ancestor() {
    let local = core_for(&account(1));
    let shared = mine(&local, 1);
    let local_only = mine(&local, 1);

    let peer = core_for(&account(9));
    peer.append_block(&shared[0]).unwrap();
    mine(&peer, 2);
    let peer_blocks = chain_of(&peer);

    local.attach_peer(VecPeer::new(peer_blocks.clone()));
    let outcome = local.synchronize(&CancellationToken::new()).unwrap();

    assert_eq!(outcome, SyncOutcome::Adopted { ancestor: 1, new_height: 3, rolled_back: 1 });
    assert_eq!(chain_of(&local), peer_blocks);
    assert_eq!(local.block_by_hash(&local_only[0].hash).unwrap(), None);
}

#[test]
fn test_bad_peer_block_restores_local_chain() {
    init_logging();
    let local = core_for(&account(1));
    let original = mine(&local, 1);
    let events = local.subscribe();

    let peer = core_for(&account(9));
    let mut peer_blocks = mine(&peer, 3);
    peer_blocks[2].nonce += 1;

    local.attach_peer(VecPeer::new(peer_blocks));
    let outcome = local.synchronize(&CancellationToken::new()).unwrap();

    assert!(matches!(outcome, SyncOutcome::Restored { .. }));
    assert_eq!(chain_of(&local), original);
    assert_eq!(local.balance(&account(1).address()).unwrap(), 50);
    assert_eq!(local.balance(&account(9).address()).unwrap(), 0);

    // removal, two adopted blocks, their removal, then the original again
    let added: Vec<bool> = events.try_iter().map(|e| matches!(e, ChainEvent::Added(_))).collect();
    assert_eq!(added, vec![false, true, true, false, false, true]);
}

#[test]
fn test_unreachable_peer_leaves_chain_alone() {
    let local = core_for(&account(1));
    let tail = local.mine_once(&CancellationToken::new()).unwrap().hash;
    local.attach_peer(Arc::new(DeadPeer));

    let result = local.synchronize(&CancellationToken::new());
    assert!(matches!(result, Err(ConsensusError::PeerUnavailable(_))));
    assert_eq!(local.tail().unwrap().hash, tail);
}

#[test]
fn test_cancelled_sync_leaves_chain_alone() {
    let local = core_for(&account(1));
    let original = mine(&local, 1);
    let peer = core_for(&account(9));
    local.attach_peer(VecPeer::new(mine(&peer, 2)));

    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(local.synchronize(&token), Err(ConsensusError::Cancelled));
    assert_eq!(chain_of(&local), original);
}

#[test]
fn test_adopted_chain_evicts_committed_transactions() {
    let a1 = account(1);
    let local = core_for(&a1);
    let peer = core_for(&account(9));

    // both chains share the block paying A1
    let shared = mine(&local, 1);
    peer.append_block(&shared[0]).unwrap();

    let tx = spend(&a1, vec![coinbase_outpoint(&shared[0])], vec![("a2".into(), 40)]);
    local.submit(tx.clone()).unwrap();
    peer.submit(tx.clone()).unwrap();
    mine(&peer, 2);

    local.attach_peer(VecPeer::new(chain_of(&peer)));
    local.synchronize(&CancellationToken::new()).unwrap();

    assert_eq!(local.height(), 3);
    assert!(local.transaction_by_hash(&tx.hash).unwrap().is_some());
    assert!(local.mining_transaction_by_hash(&tx.hash).is_none());
}

#[test]
fn test_restored_chain_keeps_pending_transactions() {
    let a1 = account(1);
    let local = core_for(&a1);
    let peer = core_for(&account(9));

    let shared = mine(&local, 1);
    peer.append_block(&shared[0]).unwrap();

    // the peer commits the pending transaction, then serves a broken block
    let tx = spend(&a1, vec![coinbase_outpoint(&shared[0])], vec![("a2".into(), 40)]);
    local.submit(tx.clone()).unwrap();
    peer.submit(tx.clone()).unwrap();
    mine(&peer, 2);
    let mut peer_blocks = chain_of(&peer);
    assert_eq!(peer_blocks[1].transactions.len(), 2);
    peer_blocks[2].nonce += 1;

    local.attach_peer(VecPeer::new(peer_blocks));
    let outcome = local.synchronize(&CancellationToken::new()).unwrap();

    assert!(matches!(outcome, SyncOutcome::Restored { .. }));
    assert_eq!(local.height(), 1);
    assert!(local.transaction_by_hash(&tx.hash).unwrap().is_none());
    assert_eq!(local.mining_transaction_by_hash(&tx.hash), Some(tx));
}

#[test]
fn test_sync_worker_adopts_longer_chain() {
    let local = core_for(&account(1));
    let peer_core = core_for(&account(9));
    let peer = VecPeer::new(vec![]);
    local.attach_peer(peer.clone());
    local.start_sync(Duration::from_millis(5)).unwrap();

    peer.replace(mine(&peer_core, 3));
    let deadline = current_timestamp() + 5_000;
    while local.height() < 3 && current_timestamp() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    local.shutdown();

    assert_eq!(local.tail(), peer_core.tail());
}

#[test]
fn test_slow_peer_does_not_block_control() {
    let local = core_for(&account(1));
    let (peer, entered, release) = GatedPeer::new();
    local.attach_peer(peer);
    let core = &local;

    thread::scope(|s| {
        let round = s.spawn(move || core.synchronize(&CancellationToken::new()));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = bounded(1);
        s.spawn(move || {
            core.stop_sync();
            core.attach_peer(VecPeer::new(vec![]));
            let _ = done_tx.send(());
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(2));
        release.send(()).unwrap();

        assert!(finished.is_ok(), "control calls waited for the peer");
        assert_eq!(round.join().unwrap(), Ok(SyncOutcome::UpToDate));
    });
}
