pub mod connection;
pub mod conversation;

pub use connection::{ConnectionModel, HEARTBEAT_TTL};
pub use conversation::{ConversationModel, ACTIVITY_BONUS, ASSIGN_TTL};
