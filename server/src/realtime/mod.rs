pub mod hub;
pub mod protocol;
pub mod websocket;

pub use hub::{Hub, Outbound};
pub use websocket::reviewer_socket;
