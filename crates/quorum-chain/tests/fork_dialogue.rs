//! Two chains wired through an in-memory message router, exercising the full
//! fork dialogue: short forks are adopted, forks crossing the checkpoint are
//! refused.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quorum_chain::{BlockChain, CpChecker, ForkProcessor};
use quorum_core::constants::ConsensusParams;
use quorum_core::types::{Address, EMPTY_HASH};
use quorum_core::{Block, BlockHeader};
use quorum_network::{MsgSender, WireMessage};
use quorum_storage::ChainDb;

type Registry = Arc<RwLock<HashMap<String, Arc<ForkProcessor>>>>;

/// Routes wire messages between the two fork processors synchronously, the
/// way the transport would deliver them.
struct TestSender {
    my_id: String,
    registry: Registry,
}

impl MsgSender for TestSender {
    fn send(&self, id: &str, msg: WireMessage) -> quorum_network::Result<()> {
        let target = self.registry.read().get(id).cloned().expect("peer registered");
        let result = match msg {
            WireMessage::ForkFindAncestorReq(m) => target.on_find_ancestor_req(&self.my_id, m),
            WireMessage::ForkFindAncestorResponse(m) => {
                target.on_find_ancestor_response(&self.my_id, m)
            }
            WireMessage::ForkChainSliceReq(m) => target.on_chain_slice_req(&self.my_id, m),
            WireMessage::ForkChainSliceResponse(m) => {
                target.on_chain_slice_response(&self.my_id, m)
            }
            other => panic!("unexpected message {}", other.name()),
        };
        // Rejections stay local to the handling node, as with a real
        // transport.
        let _ = result;
        Ok(())
    }

    fn broadcast_group(&self, _msg: WireMessage) -> quorum_network::Result<()> {
        Ok(())
    }
}

fn genesis() -> Block {
    let header = BlockHeader {
        height: 0,
        cur_time: 1000,
        prev_hash: EMPTY_HASH,
        random: [7u8; 32],
        proof: vec![],
        castor: Address::zero(),
        group_seed: [0u8; 32],
        total_qn: 0,
        tx_root: Block::compute_tx_root(&[]),
        signature: vec![],
    };
    Block::new(header, vec![])
}

/// Deterministic block builder so both chains produce identical prefixes.
fn next_block(prev: &BlockHeader, qn: u64, salt: u8) -> Block {
    let height = prev.height + 1;
    let mut random = [salt; 32];
    random[..8].copy_from_slice(&height.to_be_bytes());
    let header = BlockHeader {
        height,
        cur_time: 1000 + height,
        prev_hash: prev.hash(),
        random,
        proof: vec![],
        castor: Address::zero(),
        group_seed: [0u8; 32],
        total_qn: prev.total_qn + qn,
        tx_root: Block::compute_tx_root(&[]),
        signature: vec![],
    };
    Block::new(header, vec![])
}

fn open_chain(dir: &std::path::Path) -> Arc<BlockChain> {
    let db = Arc::new(ChainDb::open(dir).unwrap());
    let cp = CpChecker::new(ConsensusParams::default(), db.clone());
    BlockChain::new(db, cp, genesis()).unwrap()
}

fn build_to(chain: &BlockChain, height: u64, qn: u64, salt: u8) {
    while chain.height() < height {
        let block = next_block(&chain.top_header(), qn, salt);
        chain.add_block(block).unwrap();
    }
}

struct Net {
    chain1: Arc<BlockChain>,
    chain2: Arc<BlockChain>,
    fp1: Arc<ForkProcessor>,
}

fn wire(chain1: Arc<BlockChain>, chain2: Arc<BlockChain>) -> Net {
    let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
    let fp1 = Arc::new(ForkProcessor::new(
        chain1.clone(),
        Arc::new(TestSender { my_id: "1".to_string(), registry: registry.clone() }),
    ));
    let fp2 = Arc::new(ForkProcessor::new(
        chain2.clone(),
        Arc::new(TestSender { my_id: "2".to_string(), registry: registry.clone() }),
    ));
    registry.write().insert("1".to_string(), fp1.clone());
    registry.write().insert("2".to_string(), fp2);
    Net { chain1, chain2, fp1 }
}

#[test]
fn test_short_fork_adopts_heavier_peer_chain() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let chain1 = open_chain(dir1.path());
    let chain2 = open_chain(dir2.path());

    // Common history to 2996, then chain1 reaches 3000 while chain2 branches
    // four blocks back and reaches 3010 with a larger total quality number.
    build_to(&chain1, 2996, 1, 0);
    build_to(&chain2, 2996, 1, 0);
    assert_eq!(chain1.top_header().hash(), chain2.top_header().hash());

    build_to(&chain1, 3000, 1, 1);
    build_to(&chain2, 3010, 2, 2);
    assert!(chain2.top_header().heavier_than(&chain1.top_header()));

    let net = wire(chain1, chain2);
    net.fp1
        .try_process("2", net.chain2.top_header().as_ref().clone())
        .unwrap();

    assert_eq!(net.chain1.height(), 3010);
    assert_eq!(net.chain1.top_header().hash(), net.chain2.top_header().hash());
}

#[test]
fn test_fork_crossing_checkpoint_is_refused() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let chain1 = open_chain(dir1.path());
    let chain2 = open_chain(dir2.path());

    // Shared history to 2500. Chain1 reaches 3000, committing the epoch-2800
    // checkpoint on the way. Chain2 branches at 2500 and climbs to 4000 with
    // far more weight.
    build_to(&chain1, 2500, 1, 0);
    build_to(&chain2, 2500, 1, 0);
    build_to(&chain1, 3000, 1, 1);
    build_to(&chain2, 4000, 3, 2);

    assert_eq!(chain1.checkpoint().latest(), 2800);
    assert!(chain2.top_header().heavier_than(&chain1.top_header()));

    let net = wire(chain1, chain2);
    let top_before = net.chain1.top_header().hash();
    net.fp1
        .try_process("2", net.chain2.top_header().as_ref().clone())
        .unwrap();

    // The heavier chain is refused; our top is untouched.
    assert_eq!(net.chain1.height(), 3000);
    assert_eq!(net.chain1.top_header().hash(), top_before);
}

#[test]
fn test_lighter_peer_is_ignored() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let chain1 = open_chain(dir1.path());
    let chain2 = open_chain(dir2.path());

    build_to(&chain1, 50, 2, 0);
    build_to(&chain2, 40, 1, 0);

    let net = wire(chain1, chain2);
    net.fp1
        .try_process("2", net.chain2.top_header().as_ref().clone())
        .unwrap();
    assert_eq!(net.chain1.height(), 50);
}
