//! Transport for the realtime socket.

pub mod websocket;
