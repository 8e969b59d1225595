//! Model residency under host resource pressure.

pub mod controller;
pub mod policy;

pub use controller::{CryostasisController, CryostasisWatch};
pub use policy::{CryostasisMachine, Directive, Pressure, PressurePolicy, Transition};
