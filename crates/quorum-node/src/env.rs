//! Node environment: one instance of every consensus component, wired
//! explicitly through constructors. The process owns exactly one `NodeEnv`.

use std::sync::Arc;

use quorum_chain::{BlockChain, CpChecker, ForkProcessor, RewardPool, TxPool};
use quorum_consensus::group::former::{GroupFormer, RegistryGroupFilter};
use quorum_consensus::processor::ChainReaderAdapter;
use quorum_consensus::reward::RewardSigner;
use quorum_consensus::{
    spawn_sk_worker, CastContexts, ConsensusProcessor, CreateRoutine, GroupSelector, Proposer,
    SkCommand,
};
use quorum_core::constants::ConsensusParams;
use quorum_core::types::{Address, EMPTY_HASH};
use quorum_core::{Block, BlockHeader, GroupMember, SelfMinerInfo, VerifyGroup};
use quorum_crypto::{bls, sha_concat};
use quorum_network::Dispatcher;
use quorum_storage::{ChainDb, SkDb, SkRecord};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::keystore;
use crate::miner_registry::{MinerRegistry, TxPacketSender};
use crate::sender::LoopbackSender;

const REWARD_POOL_SIZE: usize = 128;

pub struct NodeEnv {
    pub config: Config,
    pub miner: Arc<SelfMinerInfo>,
    pub chain: Arc<BlockChain>,
    pub tx_pool: Arc<TxPool>,
    pub reward_pool: Arc<RewardPool>,
    pub sk_db: Arc<SkDb>,
    pub sk_tx: mpsc::Sender<SkCommand>,
    pub sk_handle: tokio::task::JoinHandle<()>,
    pub routine: Arc<CreateRoutine>,
    pub processor: Arc<ConsensusProcessor>,
    pub proposer: Arc<Proposer>,
    pub fork: Arc<ForkProcessor>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Deterministic genesis block derived from the network name.
fn genesis_block(config: &Config) -> Block {
    let header = BlockHeader {
        height: 0,
        cur_time: 0,
        prev_hash: EMPTY_HASH,
        random: sha_concat(&[config.node.name.as_bytes(), b"/genesis"]),
        proof: vec![],
        castor: Address::zero(),
        group_seed: EMPTY_HASH,
        total_qn: 0,
        tx_root: Block::compute_tx_root(&[]),
        signature: vec![],
    };
    Block::new(header, vec![])
}

/// Development bootstrap: a single-member verify group anchored to the
/// genesis hash, so a standalone chain can finalise blocks from height one.
fn seed_dev_group(
    db: &ChainDb,
    sk_db: &SkDb,
    miner: &SelfMinerInfo,
    genesis: &Block,
) -> anyhow::Result<()> {
    let seed = genesis.hash();
    if db.group_by_seed(&seed)?.is_some() {
        return Ok(());
    }

    let poly = bls::SharePolynomial::from_seed(&sha_concat(&[&miner.secret_seed, &seed]), 1);
    let msk = poly
        .share_at(1)
        .map_err(|e| anyhow::anyhow!("dev group share: {e}"))?;
    let mpk = msk.pubkey();
    let pubkey = bls::recover_pubkey(&[(1, mpk)], 1)
        .map_err(|e| anyhow::anyhow!("dev group pubkey: {e}"))?;

    let group = VerifyGroup {
        seed,
        work_height: 1,
        dismiss_height: u64::MAX / 2,
        group_height: 0,
        threshold: 1,
        pubkey: pubkey.to_vec(),
        members: vec![GroupMember {
            id: miner.id(),
            pubkey: mpk.to_vec(),
            share_index: 1,
        }],
        pre_seed: EMPTY_HASH,
    };
    db.put_group(&group)?;
    sk_db.upsert(
        &seed,
        SkRecord {
            enc_seckey: None,
            msk: Some(msk.to_bytes()),
            expire_height: u64::MAX / 2,
        },
    )?;
    info!("seeded single-member dev genesis group");
    Ok(())
}

impl NodeEnv {
    pub fn build(config: Config) -> anyhow::Result<NodeEnv> {
        let params: ConsensusParams = config.consensus.clone();

        // Fatal before networking: keystore and storage must open.
        std::fs::create_dir_all(&config.node.data_dir)
            .map_err(|e| anyhow::anyhow!("data dir unusable: {e}"))?;
        let raw_key = keystore::load_or_generate(&config.node.keystore)?;
        let miner = Arc::new(SelfMinerInfo::from_raw_key(
            &raw_key,
            config.node.miner_kind,
            config.node.stake,
        ));
        info!(id = %miner.id(), kind = ?config.node.miner_kind, "miner identity loaded");

        let db = Arc::new(
            ChainDb::open(config.chain_db_path())
                .map_err(|e| anyhow::anyhow!("chain db open failed: {e}"))?,
        );
        let sk_db = Arc::new(
            SkDb::open(config.sk_store_path())
                .map_err(|e| anyhow::anyhow!("sk store open failed: {e}"))?,
        );

        let genesis = genesis_block(&config);
        if config.node.dev_mode {
            seed_dev_group(&db, &sk_db, &miner, &genesis)?;
        }

        let cp = CpChecker::new(params.clone(), db.clone());
        let chain = BlockChain::new(db.clone(), cp, genesis)
            .map_err(|e| anyhow::anyhow!("chain open failed: {e}"))?;

        let registry = Arc::new(MinerRegistry::from_config(miner.clone(), &config.peers)?);
        let tx_pool = Arc::new(TxPool::default());
        let reward_pool = Arc::new(RewardPool::new(REWARD_POOL_SIZE));
        let sender = Arc::new(LoopbackSender::new());

        let selector = Arc::new(GroupSelector::new(
            Arc::new(ChainReaderAdapter::new(chain.clone())),
            params.clone(),
        ));
        let contexts = Arc::new(CastContexts::new());
        let fork = Arc::new(ForkProcessor::new(chain.clone(), sender.clone()));
        let reward = Arc::new(RewardSigner::new(
            chain.clone(),
            sk_db.clone(),
            registry.clone(),
            sender.clone(),
            reward_pool.clone(),
            tx_pool.clone(),
        ));

        let processor = ConsensusProcessor::new(
            params.clone(),
            chain.clone(),
            sk_db.clone(),
            contexts.clone(),
            selector.clone(),
            registry.clone(),
            sender.clone(),
            fork.clone(),
            reward,
        );
        chain.set_verifier(processor.clone());

        let former = GroupFormer::new(
            params.clone(),
            db.clone(),
            registry.clone(),
            Arc::new(RegistryGroupFilter::new(db.clone())),
        );
        chain.set_group_checker(Arc::new(former));

        let (sk_tx, sk_handle) = spawn_sk_worker(sk_db.clone());
        let packet_sender = Arc::new(TxPacketSender::new(tx_pool.clone()));
        let routine = CreateRoutine::new(
            params,
            chain.clone(),
            registry.clone(),
            packet_sender,
            Arc::new(RegistryGroupFilter::new(db.clone())),
            sk_tx.clone(),
            sk_db.clone(),
        );
        chain.events().subscribe(routine.clone());
        chain.events().subscribe(processor.clone());

        let dispatcher = Arc::new(Dispatcher::new(processor.clone()));
        sender.attach(dispatcher.clone());

        let proposer = Arc::new(Proposer::new(
            contexts,
            selector,
            registry,
            sender,
            tx_pool.clone(),
        ));

        Ok(NodeEnv {
            config,
            miner,
            chain,
            tx_pool,
            reward_pool,
            sk_db,
            sk_tx,
            sk_handle,
            routine,
            processor,
            proposer,
            fork,
            dispatcher,
        })
    }
}
