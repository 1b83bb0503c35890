//! Shared type definitions for the warden access security engine.

use serde::{Deserialize, Serialize};

/// Upper bound (in bytes) for a certificate authority chain string.
///
/// Holds the concatenated common names of the chain of authority all the way
/// back to the root certificate. Longer client-supplied chains are truncated
/// on intake.
pub const MAX_AUTH_CHAIN: usize = 2048;

/// Name of the access security group every snapshot provides and that
/// members with an unknown group name fall back to.
pub const DEFAULT_GROUP: &str = "DEFAULT";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
/// Access rights granted by a rule and cached per client.
///
/// The order is significant: a higher right implies all lower ones, and the
/// rule evaluator keeps a running maximum over this order.
pub enum AccessRights {
    /// No access at all.
    None,
    /// Read access.
    Read,
    /// Read and write access.
    Write,
    /// Read, write and remote procedure call access.
    Rpc,
}

serde_plain::derive_display_from_serialize!(AccessRights);
serde_plain::derive_fromstr_from_deserialize!(AccessRights);

bitflags::bitflags! {
    /// Rights as a bit mask (read = 1, write = 2, rpc = 4).
    pub struct AccessMask: u8 {
        const READ = 1;
        const WRITE = 2;
        const RPC = 4;
    }
}

impl AccessRights {
    /// Cumulative rights mask: `Write` implies `READ|WRITE`, `Rpc` implies
    /// all bits.
    pub fn mask(self) -> AccessMask {
        match self {
            AccessRights::None => AccessMask::empty(),
            AccessRights::Read => AccessMask::READ,
            AccessRights::Write => AccessMask::READ | AccessMask::WRITE,
            AccessRights::Rpc => AccessMask::all(),
        }
    }

    /// Test whether these rights satisfy `required`.
    pub fn allows(self, required: AccessRights) -> bool {
        self >= required
    }
}

impl Default for AccessRights {
    fn default() -> Self {
        AccessRights::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Transport protocol a client connected with.
///
/// A rule may require a specific protocol; a client without a protocol tag
/// (`Option::None` in [`Identity`]) never satisfies such a rule.
pub enum Protocol {
    /// Plain transport.
    Tcp,
    /// TLS secured transport.
    Tls,
}

serde_plain::derive_display_from_serialize!(Protocol);
serde_plain::derive_fromstr_from_deserialize!(Protocol);

impl Protocol {
    /// Parse a policy file token. Accepted case-insensitively, so both
    /// `PROTOCOL("TCP")` and `PROTOCOL("tcp")` work.
    pub fn from_config_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("tcp") {
            Some(Protocol::Tcp)
        } else if token.eq_ignore_ascii_case("tls") {
            Some(Protocol::Tls)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
/// The security relevant attributes of a client at evaluation time.
pub struct Identity {
    /// User name, matched case sensitively against UAG entries.
    pub user: String,
    /// Host name; lower-cased on intake, matched against HAG entries.
    pub host: String,
    /// Authentication method label of the transport (e.g. `"x509"`).
    pub method: String,
    /// Either the name of a configured authority chain or a concrete
    /// newline-joined chain of common names, root first.
    pub authority: String,
    /// Transport protocol, if known.
    pub protocol: Option<Protocol>,
}

impl Identity {
    /// Canonicalize an identity on intake: lower-case the host and truncate
    /// an oversized authority chain to [`MAX_AUTH_CHAIN`] bytes (on a char
    /// boundary).
    pub fn normalize(&mut self) {
        self.host.make_ascii_lowercase();
        if self.authority.len() > MAX_AUTH_CHAIN {
            let mut end = MAX_AUTH_CHAIN;
            while !self.authority.is_char_boundary(end) {
                end -= 1;
            }
            self.authority.truncate(end);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Status passed to a client's change callback.
pub enum ClientStatus {
    /// The client's cached access rights changed.
    ChangeOfAccess,
}

#[derive(thiserror::Error, Debug)]
/// Errors reported by the policy loader and the engine registry.
///
/// Each variant maps to a stable numeric code (see [`Error::code`]) so that
/// status values stay comparable across releases and language boundaries.
pub enum Error {
    #[error("clients exist for this member")]
    ClientsExist,
    #[error("no user access group named '{0}'")]
    NoUag(String),
    #[error("no host access group named '{0}'")]
    NoHag(String),
    #[error("no access allowed")]
    NoAccess,
    #[error("no modification allowed")]
    NoModify,
    #[error("bad configuration file: {0}")]
    BadConfig(String),
    #[error("bad calculation expression: {0}")]
    BadCalc(String),
    #[error("duplicate access security group named '{0}'")]
    DupAsg(String),
    #[error("access security initialization failed")]
    InitFailed,
    #[error("access security is not active")]
    NotActive,
    #[error("bad member handle")]
    BadMember,
    #[error("bad client handle")]
    BadClient,
    #[error("bad access security group")]
    BadAsg,
    #[error("out of memory")]
    NoMemory,
    #[error("duplicate method '{0}' in rule")]
    DupMethod(String),
    #[error("duplicate authority '{0}' in rule")]
    DupAuthority(String),
}

impl Error {
    /// Stable status code for this error kind.
    pub fn code(&self) -> i32 {
        match self {
            Error::ClientsExist => 1,
            Error::NoUag(_) => 2,
            Error::NoHag(_) => 3,
            Error::NoAccess => 4,
            Error::NoModify => 5,
            Error::BadConfig(_) => 6,
            Error::BadCalc(_) => 7,
            Error::DupAsg(_) => 8,
            Error::InitFailed => 9,
            Error::NotActive => 10,
            Error::BadMember => 11,
            Error::BadClient => 12,
            Error::BadAsg => 13,
            Error::NoMemory => 14,
            Error::DupMethod(_) => 15,
            Error::DupAuthority(_) => 16,
        }
    }
}
