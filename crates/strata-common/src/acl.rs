//! Access control lists attached to volumes, buckets and keys
//!
//! Text form is `type:name:rights`, e.g. `user:alice:rw`, `group:hadoop:rwl`
//! or `world::r`. Rights letters:
//!
//! | letter | right |
//! |--------|-------|
//! | `r` | READ |
//! | `w` | WRITE |
//! | `c` | CREATE |
//! | `d` | DELETE |
//! | `l` | LIST |
//! | `a` | ALL |
//! | `n` | NONE |
//! | `x` | READ_ACL |
//! | `y` | WRITE_ACL |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of identity an ACL applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclIdentityType {
    User,
    Group,
    World,
    Anonymous,
}

impl AclIdentityType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::World => "world",
            Self::Anonymous => "anonymous",
        }
    }
}

impl FromStr for AclIdentityType {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "world" => Ok(Self::World),
            "anonymous" => Ok(Self::Anonymous),
            other => Err(AclParseError::UnknownType(other.to_string())),
        }
    }
}

/// A single ACL right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclRight {
    Read,
    Write,
    Create,
    List,
    Delete,
    ReadAcl,
    WriteAcl,
    All,
    None,
}

impl AclRight {
    const fn bit(self) -> u16 {
        match self {
            Self::Read => 1 << 0,
            Self::Write => 1 << 1,
            Self::Create => 1 << 2,
            Self::List => 1 << 3,
            Self::Delete => 1 << 4,
            Self::ReadAcl => 1 << 5,
            Self::WriteAcl => 1 << 6,
            Self::All => 1 << 7,
            Self::None => 1 << 8,
        }
    }

    const fn letter(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
            Self::Create => 'c',
            Self::List => 'l',
            Self::Delete => 'd',
            Self::ReadAcl => 'x',
            Self::WriteAcl => 'y',
            Self::All => 'a',
            Self::None => 'n',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        Some(match c {
            'r' => Self::Read,
            'w' => Self::Write,
            'c' => Self::Create,
            'l' => Self::List,
            'd' => Self::Delete,
            'x' => Self::ReadAcl,
            'y' => Self::WriteAcl,
            'a' => Self::All,
            'n' => Self::None,
            _ => return None,
        })
    }

    pub const ALL_RIGHTS: [Self; 9] = [
        Self::Read,
        Self::Write,
        Self::Create,
        Self::List,
        Self::Delete,
        Self::ReadAcl,
        Self::WriteAcl,
        Self::All,
        Self::None,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Create => "CREATE",
            Self::List => "LIST",
            Self::Delete => "DELETE",
            Self::ReadAcl => "READ_ACL",
            Self::WriteAcl => "WRITE_ACL",
            Self::All => "ALL",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for AclRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of rights stored as a bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclRights(u16);

impl AclRights {
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with(mut self, right: AclRight) -> Self {
        self.0 |= right.bit();
        self
    }

    #[must_use]
    pub fn contains(&self, right: AclRight) -> bool {
        self.0 & AclRight::All.bit() != 0 || self.0 & right.bit() != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = AclRight> + '_ {
        AclRight::ALL_RIGHTS
            .into_iter()
            .filter(|r| self.0 & r.bit() != 0)
    }
}

impl FromStr for AclRights {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AclParseError::EmptyRights);
        }
        s.chars().try_fold(Self::empty(), |acc, c| {
            AclRight::from_letter(c)
                .map(|r| acc.with(r))
                .ok_or(AclParseError::UnknownRight(c))
        })
    }
}

impl fmt::Display for AclRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for right in self.iter() {
            write!(f, "{}", right.letter())?;
        }
        Ok(())
    }
}

/// Access control entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub identity_type: AclIdentityType,
    pub name: String,
    pub rights: AclRights,
}

impl Acl {
    pub fn new(identity_type: AclIdentityType, name: impl Into<String>, rights: AclRights) -> Self {
        Self {
            identity_type,
            name: name.into(),
            rights,
        }
    }

    /// Parse a comma separated list of ACLs
    pub fn parse_list(s: &str) -> Result<Vec<Self>, AclParseError> {
        s.split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::parse)
            .collect()
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.identity_type == other.identity_type && self.name == other.name
    }

    /// Merge `acl` into `acls`; returns false if nothing changed
    pub fn add_to(acls: &mut Vec<Self>, acl: &Self) -> bool {
        if let Some(existing) = acls.iter_mut().find(|a| a.same_identity(acl)) {
            let merged = existing.rights.union(acl.rights);
            if merged == existing.rights {
                return false;
            }
            existing.rights = merged;
            return true;
        }
        acls.push(acl.clone());
        true
    }

    /// Remove the rights of `acl` from `acls`; returns false if the ACL was
    /// not present. An entry left with no rights is dropped.
    pub fn remove_from(acls: &mut Vec<Self>, acl: &Self) -> bool {
        let Some(pos) = acls.iter().position(|a| a.same_identity(acl)) else {
            return false;
        };
        let remaining = acls[pos].rights.difference(acl.rights);
        if remaining == acls[pos].rights {
            return false;
        }
        if remaining.is_empty() {
            acls.remove(pos);
        } else {
            acls[pos].rights = remaining;
        }
        true
    }
}

impl FromStr for Acl {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [kind, name, rights] = parts.as_slice() else {
            return Err(AclParseError::Malformed(s.to_string()));
        };
        let identity_type: AclIdentityType = kind.parse()?;
        if matches!(identity_type, AclIdentityType::User | AclIdentityType::Group)
            && name.is_empty()
        {
            return Err(AclParseError::MissingName(s.to_string()));
        }
        Ok(Self {
            identity_type,
            name: (*name).to_string(),
            rights: rights.parse()?,
        })
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.identity_type.as_str(),
            self.name,
            self.rights
        )
    }
}

/// Errors produced when parsing ACL text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclParseError {
    #[error("acl must have the form type:name:rights, got '{0}'")]
    Malformed(String),
    #[error("unknown acl identity type: {0}")]
    UnknownType(String),
    #[error("acl '{0}' needs a user or group name")]
    MissingName(String),
    #[error("unknown acl right: {0}")]
    UnknownRight(char),
    #[error("acl rights cannot be empty")]
    EmptyRights,
}
