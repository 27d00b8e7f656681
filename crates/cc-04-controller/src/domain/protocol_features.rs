//! # Protocol Features
//!
//! Consensus upgrades are gated behind protocol features identified by a
//! digest. A block activates features by listing their digests in its
//! header; most features must first be pre-activated by a privileged
//! contract through the `preactivate_feature` intrinsic.
//!
//! ## Activation Rules
//!
//! | Rule | Failure |
//! |------|---------|
//! | Digest is recognized and enabled | `ProtocolFeature` |
//! | Block time ≥ earliest allowed activation time | `ProtocolFeature` |
//! | Not already activated | `ProtocolFeature` |
//! | Every dependency activated, pre-activated or earlier in the same list | `ProtocolFeature` |
//!
//! The set of recognized features is immutable once the controller starts;
//! activation history lives in `ProtocolFeatureManager` and mirrors the
//! `ProtocolStateObject` row.

use crate::domain::chain_objects::ProtocolStateObject;
use crate::error::{ChainError, Result};
use cc_01_state_store::{singleton_key, Database};
use serde::{Deserialize, Serialize};
use shared_types::{BlockTimestamp, Digest, TimePoint};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuiltinProtocolFeature {
    PreactivateFeature,
    OnlyBillFirstAuthorizer,
    ReplaceDeferred,
    NoDuplicateDeferredId,
    DisallowEmptyProducerSchedule,
}

impl BuiltinProtocolFeature {
    pub const ALL: [BuiltinProtocolFeature; 5] = [
        BuiltinProtocolFeature::PreactivateFeature,
        BuiltinProtocolFeature::OnlyBillFirstAuthorizer,
        BuiltinProtocolFeature::ReplaceDeferred,
        BuiltinProtocolFeature::NoDuplicateDeferredId,
        BuiltinProtocolFeature::DisallowEmptyProducerSchedule,
    ];

    pub fn codename(&self) -> &'static str {
        match self {
            Self::PreactivateFeature => "PREACTIVATE_FEATURE",
            Self::OnlyBillFirstAuthorizer => "ONLY_BILL_FIRST_AUTHORIZER",
            Self::ReplaceDeferred => "REPLACE_DEFERRED",
            Self::NoDuplicateDeferredId => "NO_DUPLICATE_DEFERRED_ID",
            Self::DisallowEmptyProducerSchedule => "DISALLOW_EMPTY_PRODUCER_SCHEDULE",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::PreactivateFeature => "allows privileged contracts to pre-activate protocol features",
            Self::OnlyBillFirstAuthorizer => "bill CPU and NET only to the first authorizer",
            Self::ReplaceDeferred => "replacing a deferred transaction re-bills RAM to the new payer",
            Self::NoDuplicateDeferredId => "deferred transaction ids include sender and sender id",
            Self::DisallowEmptyProducerSchedule => "proposed producer schedules may not be empty",
        }
    }

    pub fn dependencies(&self) -> &'static [BuiltinProtocolFeature] {
        match self {
            Self::NoDuplicateDeferredId => &[BuiltinProtocolFeature::ReplaceDeferred],
            _ => &[],
        }
    }

    /// `PREACTIVATE_FEATURE` cannot be pre-activated; it is what makes
    /// pre-activation possible.
    pub fn preactivation_required(&self) -> bool {
        !matches!(self, Self::PreactivateFeature)
    }

    /// Host functions whitelisted when the feature activates.
    fn intrinsics(&self) -> &'static [&'static str] {
        match self {
            Self::PreactivateFeature => &["preactivate_feature", "is_feature_activated"],
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFeature {
    pub feature_digest: Digest,
    pub description_digest: Digest,
    pub dependencies: BTreeSet<Digest>,
    pub earliest_allowed_activation_time: TimePoint,
    pub preactivation_required: bool,
    pub enabled: bool,
    pub builtin_feature: Option<BuiltinProtocolFeature>,
}

impl ProtocolFeature {
    /// The digest commits to the codename, description and dependencies.
    pub fn builtin(
        builtin: BuiltinProtocolFeature,
        dependencies: BTreeSet<Digest>,
        earliest_allowed_activation_time: TimePoint,
    ) -> Self {
        let description_digest = Digest::hash_bytes(builtin.description().as_bytes());
        let feature_digest =
            Digest::hash_of(&("builtin", builtin.codename(), &description_digest, &dependencies));
        Self {
            feature_digest,
            description_digest,
            dependencies,
            earliest_allowed_activation_time,
            preactivation_required: builtin.preactivation_required(),
            enabled: true,
            builtin_feature: Some(builtin),
        }
    }
}

/// Outcome of `ProtocolFeatureSet::is_recognized`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recognized {
    Unrecognized,
    Disabled,
    TooEarly,
    Ready,
}

/// Every feature this node knows how to activate.
#[derive(Clone, Debug, Default)]
pub struct ProtocolFeatureSet {
    recognized: BTreeMap<Digest, ProtocolFeature>,
    builtins: BTreeMap<BuiltinProtocolFeature, Digest>,
}

impl ProtocolFeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every builtin, enabled from `earliest`.
    pub fn with_builtins(earliest: TimePoint) -> Result<Self> {
        let mut set = Self::new();
        for builtin in BuiltinProtocolFeature::ALL {
            set.add_builtin(builtin, earliest)?;
        }
        Ok(set)
    }

    /// Register a builtin; its dependencies must already be registered.
    pub fn add_builtin(&mut self, builtin: BuiltinProtocolFeature, earliest: TimePoint) -> Result<Digest> {
        let mut deps = BTreeSet::new();
        for dep in builtin.dependencies() {
            let digest = self.builtins.get(dep).ok_or_else(|| {
                ChainError::ProtocolFeature(format!(
                    "builtin {} depends on unregistered builtin {}",
                    builtin.codename(),
                    dep.codename()
                ))
            })?;
            deps.insert(*digest);
        }
        let feature = ProtocolFeature::builtin(builtin, deps, earliest);
        let digest = feature.feature_digest;
        self.add_feature(feature)?;
        Ok(digest)
    }

    pub fn add_feature(&mut self, feature: ProtocolFeature) -> Result<()> {
        for dep in &feature.dependencies {
            if !self.recognized.contains_key(dep) {
                return Err(ChainError::ProtocolFeature(format!(
                    "feature {} depends on unrecognized feature {}",
                    feature.feature_digest, dep
                )));
            }
        }
        if let Some(builtin) = feature.builtin_feature {
            if self.builtins.contains_key(&builtin) {
                return Err(ChainError::ProtocolFeature(format!(
                    "builtin {} already registered",
                    builtin.codename()
                )));
            }
            self.builtins.insert(builtin, feature.feature_digest);
        }
        if self.recognized.insert(feature.feature_digest, feature).is_some() {
            return Err(ChainError::ProtocolFeature("duplicate protocol feature digest".into()));
        }
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Result<&ProtocolFeature> {
        self.recognized
            .get(digest)
            .ok_or_else(|| ChainError::ProtocolFeature(format!("unrecognized protocol feature {digest}")))
    }

    pub fn is_recognized(&self, digest: &Digest, at: BlockTimestamp) -> Recognized {
        match self.recognized.get(digest) {
            None => Recognized::Unrecognized,
            Some(f) if !f.enabled => Recognized::Disabled,
            Some(f) if f.earliest_allowed_activation_time > at.to_time_point() => Recognized::TooEarly,
            Some(_) => Recognized::Ready,
        }
    }

    pub fn builtin_digest(&self, builtin: BuiltinProtocolFeature) -> Option<Digest> {
        self.builtins.get(&builtin).copied()
    }

    /// `true` when `is_satisfied` holds for every dependency of `digest`.
    pub fn validate_dependencies(&self, digest: &Digest, is_satisfied: impl Fn(&Digest) -> bool) -> bool {
        self.recognized
            .get(digest)
            .map_or(false, |f| f.dependencies.iter().all(|d| is_satisfied(d)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolFeature> {
        self.recognized.values()
    }
}

/// Validate the features a block activates on top of `currently_activated`.
///
/// Used both by `start_block` and as the fork database's feature validator.
pub fn check_protocol_features(
    set: &ProtocolFeatureSet,
    timestamp: BlockTimestamp,
    currently_activated: &BTreeSet<Digest>,
    new_features: &[Digest],
) -> Result<()> {
    for (i, digest) in new_features.iter().enumerate() {
        match set.is_recognized(digest, timestamp) {
            Recognized::Ready => {}
            Recognized::Unrecognized => {
                return Err(ChainError::ProtocolFeature(format!(
                    "protocol feature with digest '{digest}' is unrecognized"
                )))
            }
            Recognized::Disabled => {
                return Err(ChainError::ProtocolFeature(format!(
                    "protocol feature with digest '{digest}' is disabled"
                )))
            }
            Recognized::TooEarly => {
                return Err(ChainError::ProtocolFeature(format!(
                    "{timestamp:?} is too early for the earliest allowed activation time of protocol feature '{digest}'"
                )))
            }
        }
        if currently_activated.contains(digest) {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{digest}' has already been activated"
            )));
        }
        let earlier = &new_features[..i];
        let satisfied =
            set.validate_dependencies(digest, |dep| currently_activated.contains(dep) || earlier.contains(dep));
        if !satisfied {
            return Err(ChainError::ProtocolFeature(format!(
                "not all dependencies of protocol feature with digest '{digest}' have been activated"
            )));
        }
    }
    Ok(())
}

/// Activation history, kept in step with the pending block.
#[derive(Debug)]
pub struct ProtocolFeatureManager {
    set: std::sync::Arc<ProtocolFeatureSet>,
    activations: Vec<(Digest, u32)>,
    builtin_activations: BTreeMap<BuiltinProtocolFeature, u32>,
    initialized: bool,
}

impl ProtocolFeatureManager {
    pub fn new(set: std::sync::Arc<ProtocolFeatureSet>) -> Self {
        Self {
            set,
            activations: Vec::new(),
            builtin_activations: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn set(&self) -> &std::sync::Arc<ProtocolFeatureSet> {
        &self.set
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Rebuild history from the protocol state row.
    pub fn init(&mut self, state: &ProtocolStateObject) -> Result<()> {
        self.activations.clear();
        self.builtin_activations.clear();
        self.initialized = true;
        for f in &state.activated_protocol_features {
            self.activate_feature(f.feature_digest, f.activation_block_num)?;
        }
        Ok(())
    }

    pub fn activate_feature(&mut self, digest: Digest, block_num: u32) -> Result<()> {
        if !self.initialized {
            return Err(ChainError::ProtocolFeature("protocol feature manager not initialized".into()));
        }
        let feature = self.set.get(&digest)?;
        if self.is_active(&digest) {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature {digest} already activated"
            )));
        }
        if let Some(&(_, last)) = self.activations.last() {
            if last > block_num {
                return Err(ChainError::ProtocolFeature(
                    "activation block numbers must be non-decreasing".into(),
                ));
            }
        }
        if let Some(builtin) = feature.builtin_feature {
            self.builtin_activations.insert(builtin, block_num);
        }
        self.activations.push((digest, block_num));
        Ok(())
    }

    /// Forget activations recorded for blocks after `block_num`.
    pub fn popped_blocks_to(&mut self, block_num: u32) {
        while let Some(&(digest, num)) = self.activations.last() {
            if num <= block_num {
                break;
            }
            self.activations.pop();
            if let Ok(f) = self.set.get(&digest) {
                if let Some(builtin) = f.builtin_feature {
                    self.builtin_activations.remove(&builtin);
                }
            }
        }
    }

    /// Active in block `current_block_num` (activated in an earlier block or
    /// in this one).
    pub fn is_builtin_activated(&self, builtin: BuiltinProtocolFeature, current_block_num: u32) -> bool {
        self.builtin_activations
            .get(&builtin)
            .map_or(false, |&num| num <= current_block_num)
    }

    pub fn is_active(&self, digest: &Digest) -> bool {
        self.activations.iter().any(|(d, _)| d == digest)
    }

    pub fn activation_block_num(&self, digest: &Digest) -> Option<u32> {
        self.activations
            .iter()
            .find(|(d, _)| d == digest)
            .map(|(_, n)| *n)
    }

    pub fn activated_set(&self) -> BTreeSet<Digest> {
        self.activations.iter().map(|(d, _)| *d).collect()
    }
}

/// Run the activation handler of `digest`, if it has one.
pub fn trigger_activation_handler(set: &ProtocolFeatureSet, digest: &Digest, db: &Database) -> Result<()> {
    let Some(builtin) = set.get(digest)?.builtin_feature else {
        return Ok(());
    };
    let intrinsics = builtin.intrinsics();
    if intrinsics.is_empty() {
        return Ok(());
    }
    db.modify::<ProtocolStateObject, _>(&singleton_key(), |ps| {
        for name in intrinsics {
            ps.whitelisted_intrinsics.insert((*name).to_string());
        }
    })?;
    info!(feature = builtin.codename(), "[cc-04] protocol feature activation handler ran");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn builtins() -> ProtocolFeatureSet {
        ProtocolFeatureSet::with_builtins(TimePoint(0)).unwrap()
    }

    #[test]
    fn test_dependency_must_be_active_or_earlier_in_list() {
        let set = builtins();
        let replace = set.builtin_digest(BuiltinProtocolFeature::ReplaceDeferred).unwrap();
        let no_dup = set.builtin_digest(BuiltinProtocolFeature::NoDuplicateDeferredId).unwrap();
        let ts = BlockTimestamp::new(10);

        let err = check_protocol_features(&set, ts, &BTreeSet::new(), &[no_dup]).unwrap_err();
        assert!(matches!(err, ChainError::ProtocolFeature(_)));

        assert!(check_protocol_features(&set, ts, &BTreeSet::new(), &[replace, no_dup]).is_ok());
        // order matters
        assert!(check_protocol_features(&set, ts, &BTreeSet::new(), &[no_dup, replace]).is_err());

        let active: BTreeSet<_> = [replace].into_iter().collect();
        assert!(check_protocol_features(&set, ts, &active, &[no_dup]).is_ok());
        assert!(check_protocol_features(&set, ts, &active, &[replace]).is_err());
    }

    #[test]
    fn test_too_early_and_unrecognized() {
        let late = TimePoint::from_secs(4_000_000_000);
        let set = ProtocolFeatureSet::with_builtins(late).unwrap();
        let d = set.builtin_digest(BuiltinProtocolFeature::PreactivateFeature).unwrap();
        let ts = BlockTimestamp::new(10);
        assert_eq!(set.is_recognized(&d, ts), Recognized::TooEarly);
        assert!(check_protocol_features(&set, ts, &BTreeSet::new(), &[d]).is_err());
        assert!(check_protocol_features(&set, ts, &BTreeSet::new(), &[Digest::hash_bytes(b"x")]).is_err());
    }

    #[test]
    fn test_manager_pops_activations_of_abandoned_blocks() {
        let set = Arc::new(builtins());
        let pre = set.builtin_digest(BuiltinProtocolFeature::PreactivateFeature).unwrap();
        let only = set.builtin_digest(BuiltinProtocolFeature::OnlyBillFirstAuthorizer).unwrap();
        let mut mgr = ProtocolFeatureManager::new(set);
        mgr.init(&ProtocolStateObject::default()).unwrap();
        mgr.activate_feature(pre, 5).unwrap();
        mgr.activate_feature(only, 7).unwrap();
        assert!(mgr.activate_feature(only, 8).is_err());
        assert!(mgr.is_builtin_activated(BuiltinProtocolFeature::OnlyBillFirstAuthorizer, 7));
        assert!(!mgr.is_builtin_activated(BuiltinProtocolFeature::OnlyBillFirstAuthorizer, 6));

        mgr.popped_blocks_to(6);
        assert!(!mgr.is_active(&only));
        assert_eq!(mgr.activation_block_num(&pre), Some(5));
        assert!(!mgr.is_builtin_activated(BuiltinProtocolFeature::OnlyBillFirstAuthorizer, 7));
    }

    #[test]
    fn test_preactivate_handler_whitelists_intrinsic() {
        let set = builtins();
        let db = Database::in_memory();
        db.create(&ProtocolStateObject::default()).unwrap();
        let pre = set.builtin_digest(BuiltinProtocolFeature::PreactivateFeature).unwrap();
        trigger_activation_handler(&set, &pre, &db).unwrap();
        let ps: ProtocolStateObject = db.get(&singleton_key()).unwrap();
        assert!(ps.whitelisted_intrinsics.contains("preactivate_feature"));
    }
}
