pub mod block_state;
pub mod errors;
pub mod header_state;

pub use block_state::{BlockState, BlockStatePtr};
pub use errors::{ForkDbError, Result};
pub use header_state::{
    BlockHeaderState, FeatureValidator, HeaderStateCommon, PendingBlockHeaderState,
    ProtocolFeatureActivationSet, ScheduleInfo, MAX_TRACKED_DPOS_CONFIRMATIONS,
    PRODUCER_REPETITIONS,
};
