//! Host bridges that play the role of the embedding frame.

pub mod websocket;

pub use websocket::{bind, serve};
