pub mod chat;
pub mod dedup;
pub mod jobs;
pub mod profile_update;
pub mod refresh;
pub mod reply;
pub mod selector;
pub mod snapshot;
pub mod topic_pool;

pub use chat::*;
pub use dedup::*;
pub use jobs::*;
pub use profile_update::*;
pub use refresh::*;
pub use reply::*;
pub use selector::*;
pub use snapshot::*;
pub use topic_pool::*;
