// Exchange-agnostic identifiers for instruments and channels
pub mod expiry;
pub mod symbol;
pub mod topic;

pub use expiry::contract_delivery_time;
pub use symbol::UXSymbol;
pub use topic::UXTopic;
