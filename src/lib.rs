pub mod client;
pub mod config;
pub mod dispatch;
pub mod packet;
pub mod pty;
pub mod registry;
pub mod server;
pub mod session;
pub mod terminal;
