//! Type definitions

pub mod campaign;
pub mod import;
pub mod job;
pub mod messages;
pub mod phonebook;

pub use campaign::*;
pub use import::*;
pub use job::*;
pub use messages::*;
pub use phonebook::*;
