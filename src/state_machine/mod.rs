//! `statig` state machines for server lifecycles and session startup.

pub mod server_sm;
pub mod startup_sm;
