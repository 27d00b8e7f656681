//! # Block Flow
//!
//! A block produced on one node, validated on another:
//!
//! ```text
//! [producer] start_block ─► push_transaction* ─► finalize ─► sign ─► commit
//!                                                                       │
//! [validator] create_block_state_future ◄───────── fetch_block_by_number┘
//!                  └─► push_block ─► apply_block ─► head
//! ```

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{
        balance, issue, sync, token_chain, transfer_action, validator,
    };
    use cc_04_controller::ChainError;
    use shared_bus::{HandlerError, SubscriptionError};
    use shared_types::{calculate_trx_merkle, TransactionStatus};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_transfer_applies_identically_on_validator() {
        let mut producer = token_chain();
        producer.start();
        issue(&mut producer, "alice", 100);
        let trace = producer
            .push(vec![transfer_action("alice", "bob", 30)], &["alice"])
            .unwrap();
        assert!(trace.except.is_none(), "{:?}", trace.except);
        assert_eq!(trace.receipt.as_ref().unwrap().status, TransactionStatus::Executed);
        let block = producer.finish();
        assert_eq!(block.block.transactions.len(), 2);

        let mut node = validator();
        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(node.controller.head_block_id(), block.id());
        for c in [&producer.controller, &node.controller] {
            assert_eq!(balance(c, "alice"), 70);
            assert_eq!(balance(c, "bob"), 30);
        }
        assert_eq!(
            node.controller.last_irreversible_block_num(),
            producer.controller.last_irreversible_block_num()
        );
    }

    #[test]
    fn test_validator_follows_from_genesis_one_block_at_a_time() {
        let mut producer = token_chain();
        producer.produce_blocks(3);
        let mut node = validator();
        assert_eq!(node.controller.head_block_num(), 1);
        for num in 2..=producer.controller.head_block_num() {
            let block = producer.controller.fetch_block_by_number(num).unwrap().unwrap();
            let fut = node
                .controller
                .create_block_state_future(&block.id(), block.clone())
                .unwrap();
            node.controller.push_block(fut, None, &|_| None).unwrap();
            assert_eq!(node.controller.head_block_num(), num);
            assert_eq!(node.controller.head_block_id(), block.id());
        }
        assert_eq!(
            node.controller.last_irreversible_block_num(),
            producer.controller.last_irreversible_block_num()
        );
    }

    #[test]
    fn test_block_header_commits_to_its_receipts() {
        let mut producer = token_chain();
        producer.start();
        issue(&mut producer, "alice", 5);
        issue(&mut producer, "bob", 7);
        let block = producer.finish();
        assert_eq!(
            calculate_trx_merkle(&block.block.transactions),
            block.block.header.transaction_mroot
        );
    }

    #[test]
    fn test_rejected_transfer_is_left_out_of_the_block() {
        let mut producer = token_chain();
        producer.start();
        issue(&mut producer, "alice", 10);
        let trace = producer
            .push(vec![transfer_action("alice", "bob", 11)], &["alice"])
            .unwrap();
        let except = trace.except.as_ref().unwrap();
        assert!(except.message.contains("alice has only 10"));
        assert!(trace.receipt.is_none());
        let block = producer.finish();
        assert_eq!(block.block.transactions.len(), 1);

        let mut node = validator();
        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(balance(&node.controller, "alice"), 10);
        assert_eq!(balance(&node.controller, "bob"), 0);
    }

    #[test]
    fn test_one_pending_block_and_stages_only_move_forward() {
        let mut producer = token_chain();
        producer.start();
        let when = producer.controller.pending_block_time().unwrap();
        assert!(matches!(
            producer.controller.start_block(when.into(), 0),
            Err(ChainError::PendingBlockExists)
        ));
        // a failed commit never leaves a pending block behind
        assert!(matches!(
            producer.controller.commit_block(),
            Err(ChainError::BlockStage(_))
        ));
        assert_eq!(producer.controller.pending_block_stage(), None);

        producer.start();
        assert_eq!(producer.controller.pending_block_stage(), Some("building"));
        producer.controller.finalize_block().unwrap();
        assert_eq!(producer.controller.pending_block_stage(), Some("assembled"));
        assert!(matches!(
            producer.controller.finalize_block(),
            Err(ChainError::BlockStage(_))
        ));
        // nothing can be pushed once the block is assembled
        let trx = producer.transaction(vec![transfer_action("alice", "bob", 1)], &["alice"]);
        assert!(producer
            .controller
            .push_transaction(trx, shared_types::TimePoint::now().add_micros(1_000_000), 0, false)
            .is_err());
        producer.controller.sign_block(&cc_04_controller::test_utils::TestChain::signer).unwrap();
        producer.controller.commit_block().unwrap();
        assert_eq!(producer.controller.pending_block_stage(), None);
    }

    #[test]
    fn test_signals_follow_block_order() {
        let mut producer = token_chain();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let signals = producer.controller.signals();
        macro_rules! record {
            ($signal:ident) => {{
                let seen = seen.clone();
                signals.$signal.connect(move |_| -> Result<(), HandlerError> {
                    seen.lock().unwrap().push(stringify!($signal));
                    Ok(())
                });
            }};
        }
        record!(block_start);
        record!(accepted_transaction);
        record!(applied_transaction);
        record!(accepted_block_header);
        record!(accepted_block);
        record!(irreversible_block);

        producer.start();
        issue(&mut producer, "alice", 1);
        producer.finish();

        let seen = seen.lock().unwrap().clone();
        let pos = |name: &str| seen.iter().position(|s| *s == name).unwrap();
        assert_eq!(seen.first(), Some(&"block_start"));
        assert!(pos("accepted_transaction") < pos("accepted_block_header"));
        assert!(pos("applied_transaction") < pos("accepted_block_header"));
        assert!(pos("accepted_block_header") < pos("accepted_block"));
        // block 2 became irreversible once block 3 was committed
        assert!(pos("accepted_block") < pos("irreversible_block"));
    }
    #[test]
    fn test_channel_subscriber_sees_irreversible_blocks_in_order() {
        let mut producer = token_chain();
        let signals = producer.controller.signals();
        let mut irreversible = signals.irreversible_block.subscribe();
        let first = producer.controller.last_irreversible_block_num() + 1;

        producer.start();
        issue(&mut producer, "bob", 3);
        producer.finish();
        producer.produce_blocks(2);

        let nums: Vec<u32> = std::iter::from_fn(|| irreversible.try_recv().ok())
            .map(|b| b.block_num())
            .collect();
        let lib = producer.controller.last_irreversible_block_num();
        assert_eq!(nums, (first..=lib).collect::<Vec<_>>());
        assert_eq!(irreversible.try_recv().unwrap_err(), SubscriptionError::Empty);
    }
}
