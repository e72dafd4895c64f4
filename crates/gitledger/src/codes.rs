//! Error domains, codes and classification flags.
//!
//! Numeric values are stable and shared with other ledger tooling;
//! `name()` gives the string used in rendered JSON.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// Subsystem an error originated from.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Ok = 0,
    Generic = 1,
    Allocator = 2,
    Git = 3,
    Policy = 4,
    Trust = 5,
    Io = 6,
    Config = 7,
}

impl Domain {
    pub const ALL: [Domain; 8] = [
        Domain::Ok,
        Domain::Generic,
        Domain::Allocator,
        Domain::Git,
        Domain::Policy,
        Domain::Trust,
        Domain::Io,
        Domain::Config,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Domain::Ok => "OK",
            Domain::Generic => "GENERIC",
            Domain::Allocator => "ALLOCATOR",
            Domain::Git => "GIT",
            Domain::Policy => "POLICY",
            Domain::Trust => "TRUST",
            Domain::Io => "IO",
            Domain::Config => "CONFIG",
        }
    }
}

impl TryFrom<u32> for Domain {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Domain::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What went wrong, independent of where.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Unknown = 1,
    OutOfMemory = 2,
    InvalidArgument = 3,
    NotFound = 4,
    Conflict = 5,
    PermissionDenied = 6,
    PolicyViolation = 7,
    TrustViolation = 8,
    IoError = 9,
    DependencyMissing = 10,
}

impl Code {
    pub const ALL: [Code; 11] = [
        Code::Ok,
        Code::Unknown,
        Code::OutOfMemory,
        Code::InvalidArgument,
        Code::NotFound,
        Code::Conflict,
        Code::PermissionDenied,
        Code::PolicyViolation,
        Code::TrustViolation,
        Code::IoError,
        Code::DependencyMissing,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Unknown => "UNKNOWN",
            Code::OutOfMemory => "OUT_OF_MEMORY",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::Conflict => "CONFLICT",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::PolicyViolation => "POLICY_VIOLATION",
            Code::TrustViolation => "TRUST_VIOLATION",
            Code::IoError => "IO_ERROR",
            Code::DependencyMissing => "DEPENDENCY_MISSING",
        }
    }
}

impl TryFrom<u32> for Code {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Code::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification bitmask.
///
/// The subsystem only classifies; acting on `RETRYABLE` is the caller's job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const RETRYABLE: Flags = Flags(1 << 0);
    pub const PERMANENT: Flags = Flags(1 << 1);
    pub const AUTH: Flags = Flags(1 << 2);

    /// Canonical emission order for names and JSON arrays.
    const ORDERED: [(Flags, &'static str); 3] = [
        (Flags::RETRYABLE, "RETRYABLE"),
        (Flags::PERMANENT, "PERMANENT"),
        (Flags::AUTH, "AUTH"),
    ];

    const KNOWN: u32 = 0b111;

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only the defined bits.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Flags {
        Flags(bits & Self::KNOWN)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Names of the set flags, in canonical order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::ORDERED
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }

    /// Pipe-joined names, e.g. `"RETRYABLE|AUTH"`. Empty when no flag is set.
    pub fn format(self) -> String {
        let mut out = String::new();
        for name in self.names() {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(name);
        }
        out
    }

    /// Default classification for a freshly built error.
    ///
    /// The domain decides first; the code is only consulted when the domain
    /// carries no opinion.
    pub const fn default_for(domain: Domain, code: Code) -> Flags {
        match domain {
            Domain::Io => return Flags::RETRYABLE,
            Domain::Policy | Domain::Trust => return Flags::PERMANENT,
            _ => {}
        }
        match code {
            Code::OutOfMemory | Code::IoError => Flags::RETRYABLE,
            Code::PolicyViolation | Code::TrustViolation | Code::InvalidArgument => {
                Flags::PERMANENT
            }
            _ => Flags::NONE,
        }
    }
}

impl BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    #[inline]
    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({})", self.format())
    }
}
