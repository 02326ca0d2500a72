//! HTTP request handlers.

pub mod browse;
pub mod chunks;
pub mod health;
pub mod webhook;

pub use browse::*;
pub use chunks::*;
pub use health::*;
pub use webhook::*;
