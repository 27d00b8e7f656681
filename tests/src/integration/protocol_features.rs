//! # Protocol Feature Activation
//!
//! `PREACTIVATE_FEATURE` is activated directly by the producer; every later
//! feature is pre-activated by a privileged contract and activated by the
//! next block, on producer and validator alike.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{sync, token_chain, validator};
    use cc_04_controller::test_utils::{ScriptedEngine, TestChain};
    use cc_04_controller::{BlockStatus, BuiltinProtocolFeature, ChainError, SetPriv, SystemAction};
    use shared_types::{AccountName, Action, BlockTimestamp, Digest, PermissionLevel, TransactionTrace};
    use std::sync::Arc;

    fn install_preactivate(engine: &ScriptedEngine) {
        engine.on("token", "preactivate", |ctx| {
            let digest: Digest = bincode::deserialize(&ctx.act().data)
                .map_err(|e| ChainError::ActionValidate(e.to_string()))?;
            ctx.preactivate_feature(&digest)
        });
    }

    fn preactivate(chain: &mut TestChain, digest: &Digest) -> Arc<TransactionTrace> {
        let data = bincode::serialize(digest).unwrap();
        let act = Action::new("token", "preactivate", vec![PermissionLevel::new("token", "active")], data);
        chain.push(vec![act], &["token"]).unwrap()
    }

    fn digest(chain: &TestChain, builtin: BuiltinProtocolFeature) -> Digest {
        chain
            .controller
            .protocol_features()
            .set()
            .builtin_digest(builtin)
            .unwrap()
    }

    #[test]
    fn test_dependencies_must_activate_first() {
        let mut producer = token_chain();
        let mut node = validator();
        install_preactivate(&producer.engine);
        install_preactivate(&node.engine);
        let pre = digest(&producer, BuiltinProtocolFeature::PreactivateFeature);
        let replace = digest(&producer, BuiltinProtocolFeature::ReplaceDeferred);
        let no_dup = digest(&producer, BuiltinProtocolFeature::NoDuplicateDeferredId);

        // token becomes privileged; PREACTIVATE_FEATURE activates with this block
        let when = BlockTimestamp::from(producer.controller.head_block_time().add_micros(500_000));
        producer
            .controller
            .start_block_with(when, 0, vec![pre], BlockStatus::Incomplete, None)
            .unwrap();
        let setpriv = SetPriv {
            account: AccountName::new("token"),
            is_priv: true,
        }
        .to_action(vec![PermissionLevel::new("system", "active")]);
        let trace = producer.push(vec![setpriv], &["system"]).unwrap();
        assert!(trace.except.is_none(), "{:?}", trace.except);
        producer.finish();

        producer.start();
        let trace = preactivate(&mut producer, &no_dup);
        let except = trace.except.as_ref().expect("dependency not yet active");
        assert!(except.message.contains("dependencies"), "{}", except.message);
        let trace = preactivate(&mut producer, &replace);
        assert!(trace.except.is_none(), "{:?}", trace.except);
        producer.finish();

        producer.start();
        assert!(producer.controller.protocol_features().is_active(&replace));
        let trace = preactivate(&mut producer, &no_dup);
        assert!(trace.except.is_none(), "{:?}", trace.except);
        producer.finish();
        let last = producer.produce_block();
        assert_eq!(last.block.header.new_protocol_feature_activations, vec![no_dup]);

        sync(&producer.controller, &mut node.controller).unwrap();
        assert_eq!(node.controller.head_block_id(), last.id());
        for feature in [pre, replace, no_dup] {
            assert!(node.controller.protocol_features().is_active(&feature));
        }
    }

    #[test]
    fn test_unknown_feature_fails_block_start() {
        let mut producer = TestChain::new();
        let when = BlockTimestamp::from(producer.controller.head_block_time().add_micros(500_000));
        let bogus = Digest::hash_of(&"not a feature");
        let err = producer
            .controller
            .start_block_with(when, 0, vec![bogus], BlockStatus::Incomplete, None)
            .unwrap_err();
        assert!(matches!(err, ChainError::ProtocolFeature(_)), "{err:?}");
        assert!(producer.controller.pending_block_stage().is_none());
    }
}
