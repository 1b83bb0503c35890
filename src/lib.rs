//! Access security policy engine for distributed control systems.
//!
//! A policy file declares user groups (`UAG`), host groups (`HAG`),
//! certificate authority chains (`AUTHORITY`) and access security groups
//! (`ASG`) holding ordered rule lists. The [`SecurityEngine`] loads such a
//! policy (hot-swappable at runtime), binds resources as members and
//! identities as clients, and answers, for every client, whether reads,
//! writes and RPCs are permitted and whether writes must be audited through
//! the [`trap_write`] fan-out.

pub mod engine;
mod slab;
pub mod trap_write;

pub use engine::{ClientHandle, MemberHandle, SecurityEngine};
pub use trap_write::{
    ListenerId, TrapWriteMessage, TrapWriteMux, TrapWritePhase, WriteToken,
};
pub use warden_api_types::{
    AccessMask, AccessRights, ClientStatus, Error, Identity, Protocol,
};
