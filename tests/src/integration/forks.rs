//! # Fork Choice
//!
//! Competing branches, invalid blocks and the irreversible read mode.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{balance, install_token, issue, sync, token_chain, validator};
    use cc_03_fork_database::BlockStatePtr;
    use cc_04_controller::test_utils::TestChain;
    use cc_04_controller::{ChainError, DbReadMode};
    use shared_types::{Action, BlockTimestamp, PermissionLevel, SignedBlock};
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    /// Start a block `slots` slots after the head.
    fn start_at(chain: &mut TestChain, slots: i64) {
        let when = chain.controller.head_block_time().add_micros(500_000 * slots);
        chain.controller.start_block(BlockTimestamp::from(when), 0).unwrap();
    }

    fn push(chain: &mut TestChain, block: Arc<SignedBlock>) -> Result<(), ChainError> {
        let fut = chain.controller.create_block_state_future(&block.id(), block)?;
        chain.controller.push_block(fut, None, &|_| None)
    }

    #[test]
    fn test_block_with_stripped_receipts_is_rejected() {
        let mut producer = token_chain();
        let mut node = validator();
        sync(&producer.controller, &mut node.controller).unwrap();
        let head_before = node.controller.head_block_id();

        producer.start();
        issue(&mut producer, "alice", 40);
        let block = producer.finish();

        let mut stripped = (*block.block).clone();
        stripped.transactions.clear();
        // receipts are not part of the header, so the id is unchanged
        assert_eq!(stripped.id(), block.id());
        let err = push(&mut node, Arc::new(stripped)).unwrap_err();
        assert!(matches!(err, ChainError::ObjectiveBlockValidation(_)), "{err:?}");
        assert_eq!(node.controller.head_block_id(), head_before);
        assert!(node.controller.pending_block_stage().is_none());
        assert_eq!(balance(&node.controller, "alice"), 0);

        push(&mut node, block.block.clone()).unwrap();
        assert_eq!(node.controller.head_block_id(), block.id());
        assert_eq!(balance(&node.controller, "alice"), 40);
    }

    #[test]
    fn test_receipt_net_usage_is_billed_as_committed() {
        let mut producer = token_chain();
        let mut node = validator();
        sync(&producer.controller, &mut node.controller).unwrap();
        let head_before = node.controller.head_block_id();

        producer.start();
        issue(&mut producer, "alice", 25);
        let block = producer.finish();

        // the validator bills the receipt's NET, so only the merkle root can
        // catch a receipt that disagrees with the header
        let mut tampered = (*block.block).clone();
        tampered.transactions[0].header.net_usage_words += 1;
        let err = push(&mut node, Arc::new(tampered)).unwrap_err();
        assert!(matches!(err, ChainError::ObjectiveBlockValidation(ref m) if m.contains("transaction_mroot")), "{err:?}");
        assert_eq!(node.controller.head_block_id(), head_before);

        push(&mut node, block.block.clone()).unwrap();
        assert_eq!(node.controller.head_block_id(), block.id());
        assert_eq!(balance(&node.controller, "alice"), 25);
    }

    #[test]
    fn test_fork_switch_replaces_state_of_dropped_branch() {
        let mut a = token_chain();
        let mut b = validator();
        sync(&a.controller, &mut b.controller).unwrap();

        start_at(&mut a, 1);
        issue(&mut a, "alice", 10);
        let a3 = a.finish();

        start_at(&mut b, 2);
        issue(&mut b, "bob", 5);
        let b3 = b.finish();
        let b4 = b.produce_block();

        push(&mut a, b3.block.clone()).unwrap();
        assert_eq!(a.controller.head_block_id(), a3.id());

        let dropped: Arc<Mutex<Vec<BlockStatePtr>>> = Arc::default();
        let record = dropped.clone();
        let cb = move |branch: &[BlockStatePtr]| record.lock().unwrap().extend_from_slice(branch);
        let fut = a
            .controller
            .create_block_state_future(&b4.id(), b4.block.clone())
            .unwrap();
        a.controller.push_block(fut, Some(&cb), &|_| None).unwrap();

        assert_eq!(a.controller.head_block_id(), b4.id());
        let dropped = dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id(), a3.id());
        assert_eq!(balance(&a.controller, "alice"), 0);
        assert_eq!(balance(&a.controller, "bob"), 5);
        assert_eq!(a.controller.last_irreversible_block_id(), Some(b3.id()));
    }

    #[test]
    fn test_failed_fork_switch_restores_previous_branch() {
        let mut a = token_chain();
        let mut b = validator();
        sync(&a.controller, &mut b.controller).unwrap();

        start_at(&mut a, 1);
        issue(&mut a, "alice", 10);
        let a3 = a.finish();

        start_at(&mut b, 2);
        issue(&mut b, "bob", 5);
        let b3 = b.finish();
        b.start();
        issue(&mut b, "bob", 1);
        let b4 = b.finish();

        push(&mut a, b3.block.clone()).unwrap();
        assert_eq!(a.controller.head_block_id(), a3.id());

        let mut stripped = (*b4.block).clone();
        stripped.transactions.clear();
        let forked = Arc::new(Mutex::new(0usize));
        let count = forked.clone();
        let cb = move |branch: &[BlockStatePtr]| *count.lock().unwrap() += branch.len();
        let fut = a
            .controller
            .create_block_state_future(&b4.id(), Arc::new(stripped))
            .unwrap();
        let err = a.controller.push_block(fut, Some(&cb), &|_| None).unwrap_err();
        assert!(matches!(err, ChainError::ObjectiveBlockValidation(_)), "{err:?}");

        // the old branch was popped for the attempt and then re-applied
        assert_eq!(*forked.lock().unwrap(), 1);
        assert_eq!(a.controller.head_block_id(), a3.id());
        assert!(a.controller.pending_block_stage().is_none());
        assert_eq!(balance(&a.controller, "alice"), 10);
        assert_eq!(balance(&a.controller, "bob"), 0);
        assert_eq!(a.controller.db().revision(), 3);

        let next = a.produce_block();
        assert_eq!(next.block_num(), 4);
        assert_eq!(*next.block.previous(), a3.id());
    }

    #[test]
    fn test_irreversible_mode_applies_only_irreversible_blocks() {
        let mut producer = token_chain();
        let mut node = TestChain::with_config(|c| c.read_mode = DbReadMode::Irreversible);
        install_token(&node.engine);

        producer.start();
        issue(&mut producer, "alice", 50);
        producer.finish();
        sync(&producer.controller, &mut node.controller).unwrap();

        let lib = producer.controller.last_irreversible_block_num();
        assert_eq!(node.controller.head_block_num(), lib);
        assert_eq!(node.controller.fork_db_head_block_num(), producer.controller.head_block_num());
        assert_eq!(balance(&node.controller, "alice"), 0);

        producer.produce_block();
        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(node.controller.head_block_num(), lib + 1);
        assert_eq!(balance(&node.controller, "alice"), 50);
    }
    #[test]
    fn test_irreversible_progress_is_kept_when_a_later_block_fails() {
        let mut producer = token_chain();
        let mut node = TestChain::with_config(|c| c.read_mode = DbReadMode::Irreversible);
        install_token(&node.engine);
        sync(&producer.controller, &mut node.controller).unwrap();

        // `token::flaky(n)` fails on the node while `n` is listed
        let failing: Arc<Mutex<BTreeSet<u64>>> = Arc::default();
        producer.engine.on("token", "flaky", |_| Ok(()));
        let listed = failing.clone();
        node.engine.on("token", "flaky", move |ctx| {
            let n: u64 = bincode::deserialize(&ctx.act().data)
                .map_err(|e| ChainError::ActionValidate(e.to_string()))?;
            if listed.lock().unwrap().contains(&n) {
                return Err(ChainError::ContractAssert(format!("flaky {n}")));
            }
            Ok(())
        });
        let base = producer.controller.head_block_num();
        let mut blocks = Vec::new();
        for n in [1u64, 2] {
            producer.start();
            let act = Action::new(
                "token",
                "flaky",
                vec![PermissionLevel::new("token", "active")],
                bincode::serialize(&n).unwrap(),
            );
            let trace = producer.push(vec![act], &["token"]).unwrap();
            assert!(trace.except.is_none(), "{:?}", trace.except);
            blocks.push(producer.finish());
        }
        blocks.push(producer.produce_block());
        blocks.push(producer.produce_block());

        failing.lock().unwrap().insert(1);
        push(&mut node, blocks[0].block.clone()).unwrap();
        assert!(push(&mut node, blocks[1].block.clone()).is_err());
        assert_eq!(node.controller.last_irreversible_block_num(), base);

        // one pass now logs base + 1 and then fails on base + 2
        *failing.lock().unwrap() = BTreeSet::from([2]);
        let err = push(&mut node, blocks[2].block.clone()).unwrap_err();
        assert!(matches!(err, ChainError::BlockValidate(ref m) if m.contains("flaky 2")), "{err:?}");
        assert_eq!(node.controller.last_irreversible_block_id(), Some(blocks[0].id()));
        assert_eq!(node.controller.head_block_id(), blocks[0].id());
        assert!(node.controller.fetch_block_by_number(base + 1).unwrap().is_some());
        assert!(node.controller.pending_block_stage().is_none());

        failing.lock().unwrap().clear();
        push(&mut node, blocks[3].block.clone()).unwrap();
        assert_eq!(node.controller.head_block_id(), blocks[2].id());
        assert_eq!(node.controller.last_irreversible_block_num(), base + 3);
    }
}
