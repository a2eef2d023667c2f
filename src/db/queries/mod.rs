//! Database queries

pub mod campaign;
pub mod contact;
pub mod lease;
pub mod phonebook;
