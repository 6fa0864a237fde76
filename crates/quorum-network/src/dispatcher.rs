use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::decode_frame;
use crate::error::{NetworkError, Result};
use crate::messages::*;

/// Outbound side of the transport, injected by the host. `id` is the opaque
/// peer identifier the transport understands.
pub trait MsgSender: Send + Sync {
    fn send(&self, id: &str, msg: WireMessage) -> Result<()>;
    /// Deliver to every member of the current verify group.
    fn broadcast_group(&self, msg: WireMessage) -> Result<()>;
}

/// Inbound message surface of the consensus core. One implementor handles
/// proposer/verifier traffic, the chain handles the fork dialogue.
pub trait MessageHandler: Send + Sync {
    fn on_cast_verify(&self, source: &str, msg: CastVerifyMsg) -> Result<()>;
    fn on_verified_cast(&self, source: &str, msg: VerifiedCastMsg) -> Result<()>;
    fn on_reward_sign_req(&self, source: &str, msg: CastRewardSignReq) -> Result<()>;
    fn on_reward_sign_got(&self, source: &str, msg: CastRewardSignGot) -> Result<()>;
    fn on_req_proposal_block(&self, source: &str, msg: ReqProposalBlock) -> Result<()>;
    fn on_response_proposal_block(&self, source: &str, msg: ResponseProposalBlock)
        -> Result<()>;
    fn on_find_ancestor_req(&self, source: &str, msg: ForkFindAncestorReq) -> Result<()>;
    fn on_find_ancestor_response(
        &self,
        source: &str,
        msg: ForkFindAncestorResponse,
    ) -> Result<()>;
    fn on_chain_slice_req(&self, source: &str, msg: ForkChainSliceReq) -> Result<()>;
    fn on_chain_slice_response(&self, source: &str, msg: ForkChainSliceResponse)
        -> Result<()>;
}

/// Routes decoded frames to the handler by message code. A panic inside a
/// handler is trapped and logged; it never crosses the dispatch boundary.
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { handler }
    }

    pub fn dispatch(&self, source: &str, frame: &[u8]) -> Result<()> {
        let msg = decode_frame(frame)?;
        debug!(source, msg = msg.name(), "dispatching message");

        let handler = self.handler.clone();
        let source_owned = source.to_string();
        let result = catch_unwind(AssertUnwindSafe(move || {
            Self::route(handler.as_ref(), &source_owned, msg)
        }));
        match result {
            Ok(r) => r,
            Err(_) => {
                warn!(source, "message handler panicked");
                Err(NetworkError::HandlerPanic)
            }
        }
    }

    fn route(handler: &dyn MessageHandler, source: &str, msg: WireMessage) -> Result<()> {
        match msg {
            WireMessage::CastVerify(m) => handler.on_cast_verify(source, m),
            WireMessage::VerifiedCast(m) => handler.on_verified_cast(source, m),
            WireMessage::CastRewardSignReq(m) => handler.on_reward_sign_req(source, m),
            WireMessage::CastRewardSignGot(m) => handler.on_reward_sign_got(source, m),
            WireMessage::ReqProposalBlock(m) => handler.on_req_proposal_block(source, m),
            WireMessage::ResponseProposalBlock(m) => {
                handler.on_response_proposal_block(source, m)
            }
            WireMessage::ForkFindAncestorReq(m) => handler.on_find_ancestor_req(source, m),
            WireMessage::ForkFindAncestorResponse(m) => {
                handler.on_find_ancestor_response(source, m)
            }
            WireMessage::ForkChainSliceReq(m) => handler.on_chain_slice_req(source, m),
            WireMessage::ForkChainSliceResponse(m) => {
                handler.on_chain_slice_response(source, m)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        panic_on_cast: bool,
    }

    impl MessageHandler for CountingHandler {
        fn on_cast_verify(&self, _s: &str, _m: CastVerifyMsg) -> Result<()> {
            if self.panic_on_cast {
                panic!("boom");
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_verified_cast(&self, _s: &str, _m: VerifiedCastMsg) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_reward_sign_req(&self, _s: &str, _m: CastRewardSignReq) -> Result<()> {
            Ok(())
        }
        fn on_reward_sign_got(&self, _s: &str, _m: CastRewardSignGot) -> Result<()> {
            Ok(())
        }
        fn on_req_proposal_block(&self, _s: &str, _m: ReqProposalBlock) -> Result<()> {
            Ok(())
        }
        fn on_response_proposal_block(
            &self,
            _s: &str,
            _m: ResponseProposalBlock,
        ) -> Result<()> {
            Ok(())
        }
        fn on_find_ancestor_req(&self, _s: &str, _m: ForkFindAncestorReq) -> Result<()> {
            Ok(())
        }
        fn on_find_ancestor_response(
            &self,
            _s: &str,
            _m: ForkFindAncestorResponse,
        ) -> Result<()> {
            Ok(())
        }
        fn on_chain_slice_req(&self, _s: &str, _m: ForkChainSliceReq) -> Result<()> {
            Ok(())
        }
        fn on_chain_slice_response(
            &self,
            _s: &str,
            _m: ForkChainSliceResponse,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_routes_by_code() {
        let handler = Arc::new(CountingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone());
        let frame = encode_frame(&WireMessage::VerifiedCast(VerifiedCastMsg {
            block_hash: [0u8; 32],
            member: quorum_core::types::Address::zero(),
            sign: vec![],
        }))
        .unwrap();
        dispatcher.dispatch("peer-1", &frame).unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_trapped() {
        let handler = Arc::new(CountingHandler {
            panic_on_cast: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(handler);
        let header = quorum_core::BlockHeader {
            height: 1,
            cur_time: 0,
            prev_hash: [0u8; 32],
            random: [0u8; 32],
            proof: vec![],
            castor: quorum_core::types::Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: [0u8; 32],
            signature: vec![],
        };
        let frame = encode_frame(&WireMessage::CastVerify(CastVerifyMsg {
            header,
            prev_random: [0u8; 32],
        }))
        .unwrap();
        assert!(matches!(
            dispatcher.dispatch("peer-1", &frame),
            Err(NetworkError::HandlerPanic)
        ));
    }
}
