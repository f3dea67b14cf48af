// rlsdb Common Module

pub mod types;
pub mod context;

pub use types::{
    DataIndex, FailureScope, LogIdentity, LogType, RuId, SectionId, ServiceId, CONTROL_ROW_ID,
    SINGLE_DATA_INDEX,
};
pub use context::{FailureHook, LoggingFailureHook, OwnershipScheme, ServerContext};
