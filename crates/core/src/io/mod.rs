//! Transport helpers: how a front end talks to the runtime over the bus.

pub mod input;
pub mod output;

pub use input::submit;
pub use output::{OutputKind, OutputMessage, OutputReceiver, attach};
