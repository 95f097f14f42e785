pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    ConversationLink, LinkKind, MessageCorrespondence, Origin, SubscriptionKind,
    SubscriptionRecord, UserCorrespondence,
};
pub use self::stores::{
    KvCondition, KvOp, KvStore, LinkStore, MarkerStore, MessageStore, SubscriptionStore,
    UserStore,
};

pub mod error;
pub mod manager;
pub mod memory;
pub mod models;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod schema;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub(crate) fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
