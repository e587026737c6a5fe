pub mod websocket;

pub use websocket::space_channel;
