//! 实时通道：连接绑定、在线广播与网关

pub mod broadcaster;
pub mod gateway;
pub mod session;

pub use broadcaster::{
    BroadcastError, LocalRealtimeBroadcaster, RealtimeBroadcaster, RealtimeEvent,
    ONLINE_USERS_EVENT,
};
pub use gateway::{AcceptedConnection, RealtimeGateway};
pub use session::SocketSessionBinding;
