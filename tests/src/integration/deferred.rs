//! # Deferred Transactions Across Nodes
//!
//! A contract schedules a transaction; the producer runs it once its delay
//! passes and includes an id-only receipt. Validators must reach the same
//! outcome from that receipt alone.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{balance, issue_action, sync, token_chain, validator};
    use cc_04_controller::test_utils::{ScriptedEngine, TestChain};
    use cc_04_controller::GeneratedTransactionObject;
    use shared_types::{
        AccountName, Action, PermissionLevel, ReceiptTrx, TimePoint, Transaction, TransactionStatus,
    };

    /// `token::later` schedules `token::<inner>` one second out.
    fn schedule(engine: &ScriptedEngine, inner: Action) {
        engine.on("token", "later", move |ctx| {
            let mut trx = Transaction {
                actions: vec![inner.clone()],
                ..Default::default()
            };
            trx.header.delay_sec = 1;
            ctx.schedule_deferred(1, &AccountName::new("token"), trx, false)
        });
    }

    fn later() -> Action {
        Action::new("token", "later", vec![PermissionLevel::new("token", "active")], vec![])
    }

    fn deadline() -> TimePoint {
        TimePoint::now().add_micros(10_000_000)
    }

    /// Schedule `inner`, wait out its delay and push it. Returns the
    /// receipt status.
    fn run_deferred(producer: &mut TestChain, node: &TestChain, inner: Action) -> TransactionStatus {
        schedule(&producer.engine, inner.clone());
        schedule(&node.engine, inner);
        producer.start();
        let trace = producer.push(vec![later()], &["token"]).unwrap();
        assert!(trace.except.is_none(), "{:?}", trace.except);
        producer.finish();
        producer.produce_blocks(2);

        producer.start();
        let ids = producer.controller.get_scheduled_transactions().unwrap();
        assert_eq!(ids.len(), 1);
        let trace = producer
            .controller
            .push_scheduled_transaction(&ids[0], deadline(), 0, false)
            .unwrap();
        let block = producer.finish();
        assert_eq!(block.block.transactions.len(), 1);
        assert_eq!(block.block.transactions[0].trx, ReceiptTrx::Id(ids[0]));
        trace.receipt.as_ref().unwrap().status
    }

    #[test]
    fn test_deferred_issue_runs_on_validator() {
        let mut producer = token_chain();
        let mut node = validator();
        let status = run_deferred(&mut producer, &node, issue_action("bob", 12));
        assert_eq!(status, TransactionStatus::Executed);

        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(node.controller.head_block_id(), producer.controller.head_block_id());
        assert_eq!(balance(&node.controller, "bob"), 12);
        assert!(node
            .controller
            .db()
            .all::<GeneratedTransactionObject>()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_soft_failed_deferred_validates_on_validator() {
        let mut producer = token_chain();
        let mut node = validator();
        for engine in [&producer.engine, &node.engine] {
            engine.on("token", "boom", |_| {
                Err(cc_04_controller::ChainError::ContractAssert("boom".into()))
            });
        }
        let boom = Action::new("token", "boom", vec![PermissionLevel::new("token", "active")], vec![]);
        let status = run_deferred(&mut producer, &node, boom);
        assert_eq!(status, TransactionStatus::SoftFail);

        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(node.controller.head_block_id(), producer.controller.head_block_id());
        assert!(node
            .controller
            .db()
            .all::<GeneratedTransactionObject>()
            .unwrap()
            .is_empty());
    }
}
