//! # Recovery
//!
//! Rebuilding a node from its block log and reversible block store, and
//! starting one from a snapshot.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{
        balance, install_token, issue, sync, token_chain, transfer_action,
    };
    use cc_02_block_log::ReversibleBlockStore;
    use cc_03_fork_database::FORK_DB_FILENAME;
    use cc_04_controller::test_utils::{ScriptedEngine, TestChain};
    use cc_04_controller::{ChainError, Controller, ControllerConfig};
    use shared_types::Digest;
    use std::path::Path;
    use std::sync::Arc;

    fn copy_dir(from: &Path, to: &Path) {
        std::fs::create_dir_all(to).unwrap();
        for entry in std::fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_file() {
                std::fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
            }
        }
    }

    fn busy_chain() -> TestChain {
        let mut chain = token_chain();
        chain.start();
        issue(&mut chain, "alice", 100);
        chain.finish();
        for amount in [10, 20, 30] {
            chain.start();
            let trace = chain
                .push(vec![transfer_action("alice", "bob", amount)], &["alice"])
                .unwrap();
            assert!(trace.except.is_none(), "{:?}", trace.except);
            chain.finish();
        }
        chain
    }

    fn token_engine() -> Arc<ScriptedEngine> {
        let engine = Arc::new(ScriptedEngine::new());
        install_token(&engine);
        engine
    }

    #[test]
    fn test_replay_reaches_the_same_state() {
        let mut chain = busy_chain();
        let head_id = chain.controller.head_block_id();
        let rows = chain.controller.db().export_rows();
        let config = chain.controller.config().clone();
        chain.controller.close().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let replay_config = ControllerConfig {
            blocks_dir: dir.path().join("blocks"),
            state_dir: dir.path().join("state"),
            ..config.clone()
        };
        copy_dir(&config.blocks_dir, &replay_config.blocks_dir);
        std::fs::create_dir_all(&replay_config.state_dir).unwrap();
        std::fs::copy(config.reversible_blocks_path(), replay_config.reversible_blocks_path()).unwrap();

        let replayed = TestChain::open(replay_config, token_engine());
        assert_eq!(replayed.head_block_id(), head_id);
        assert_eq!(replayed.db().export_rows(), rows);
        assert_eq!(balance(&replayed, "alice"), 40);
        assert_eq!(balance(&replayed, "bob"), 60);
    }

    #[test]
    fn test_missing_fork_database_requires_replay() {
        let mut chain = busy_chain();
        let config = chain.controller.config().clone();
        chain.controller.close().unwrap();
        std::fs::remove_file(config.state_dir.join(FORK_DB_FILENAME)).unwrap();

        let mut controller = Controller::builder(config).engine(token_engine()).build().unwrap();
        let err = controller.startup(Some(&TestChain::genesis())).unwrap_err();
        assert!(matches!(err, ChainError::Startup(ref msg) if msg.contains("Replay required")));
    }

    #[test]
    fn test_reversible_store_must_match_fork_database() {
        let mut chain = busy_chain();
        let config = chain.controller.config().clone();
        let head_num = chain.controller.head_block_num();
        chain.controller.close().unwrap();

        let mut store = ReversibleBlockStore::open(config.reversible_blocks_path()).unwrap();
        let mut other = store.get(head_num).unwrap().expect("head block is reversible");
        other.header.action_mroot = Digest::hash_of(&"another branch");
        store.add(&other).unwrap();
        drop(store);

        let mut controller = Controller::builder(config).engine(token_engine()).build().unwrap();
        let err = controller.startup(Some(&TestChain::genesis())).unwrap_err();
        assert!(
            matches!(err, ChainError::Startup(ref msg) if msg.contains("fork database pending head")),
            "{err:?}"
        );
    }

    #[test]
    fn test_snapshot_node_follows_the_producer() {
        let mut producer = busy_chain();
        let snapshot = producer.controller.snapshot().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            blocks_dir: dir.path().join("blocks"),
            state_dir: dir.path().join("state"),
            ..Default::default()
        };
        let mut node = Controller::builder(config).engine(token_engine()).build().unwrap();
        node.startup_from_snapshot(&snapshot).unwrap();
        assert_eq!(node.head_block_id(), producer.controller.head_block_id());
        assert_eq!(balance(&node, "bob"), 60);

        producer.start();
        let trace = producer
            .push(vec![transfer_action("bob", "alice", 15)], &["bob"])
            .unwrap();
        assert!(trace.except.is_none(), "{:?}", trace.except);
        producer.finish();
        producer.produce_blocks(2);

        sync(&producer.controller, &mut node).unwrap();
        assert_eq!(node.head_block_id(), producer.controller.head_block_id());
        assert_eq!(balance(&node, "alice"), 55);
        assert_eq!(balance(&node, "bob"), 45);
        assert_eq!(
            node.last_irreversible_block_num(),
            producer.controller.last_irreversible_block_num()
        );
        // irreversible blocks past the snapshot reached the new node's log
        let lib = node.last_irreversible_block_num();
        assert!(lib > snapshot.head_block_num());
        assert!(node.fetch_block_by_number(lib).unwrap().is_some());
    }
}
