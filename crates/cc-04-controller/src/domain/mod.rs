//! Domain layer: state rows, pending block stages, protocol features,
//! genesis and snapshots.

pub mod authority;
pub mod chain_objects;
pub mod genesis;
pub mod pending_block;
pub mod protocol_features;
pub mod resource;
pub mod snapshot;
pub mod system_actions;

pub use authority::{Authority, KeyWeight, PermissionLevelWeight, PermissionObject, WaitWeight};
pub use chain_objects::*;
pub use genesis::GenesisState;
pub use pending_block::{
    AssembledBlock, BlockStage, BlockStatus, BuildingBlock, CompletedBlock, PendingState,
    TrxMrootOrDigests,
};
pub use protocol_features::{
    check_protocol_features, BuiltinProtocolFeature, ProtocolFeature, ProtocolFeatureManager,
    ProtocolFeatureSet, Recognized,
};
pub use resource::{AccountResourceLimits, ElasticLimitParameters, Ratio, UsageAccumulator};
pub use snapshot::Snapshot;
pub use system_actions::{
    DeleteAuth, NewAccount, OnBlock, OnError, SetCode, SetPriv, SystemAction, UpdateAuth,
};
