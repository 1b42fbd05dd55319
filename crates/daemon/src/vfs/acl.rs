//! Translation between backend permission lists and protocol ACEs, mode
//! derivation, and the pure parts of the access decision.

use std::path::Path;

use bitflags::bitflags;

use common::prelude::{
    BackendError, ObjectKind, PermissionEntry, PermissionLevel, Session, SubjectKind,
};

use super::id_mapper::IdMapper;

bitflags! {
    /// ACE access mask bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AceMask: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_NAMED_ATTRS = 0x0000_0008;
        const WRITE_NAMED_ATTRS = 0x0000_0010;
        const EXECUTE = 0x0000_0020;
        const DELETE_CHILD = 0x0000_0040;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const READ_ACL = 0x0002_0000;
        const WRITE_ACL = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AceFlags: u32 {
        const FILE_INHERIT = 0x0000_0001;
        const DIRECTORY_INHERIT = 0x0000_0002;
        const IDENTIFIER_GROUP = 0x0000_0040;
    }
}

impl AceMask {
    /// Bits granted by the `own` level
    pub const OWN: AceMask = AceMask::READ_DATA
        .union(AceMask::WRITE_DATA)
        .union(AceMask::APPEND_DATA)
        .union(AceMask::DELETE)
        .union(AceMask::WRITE_OWNER);

    /// Bits granted by the `write` level
    pub const WRITE: AceMask = AceMask::READ_DATA
        .union(AceMask::WRITE_DATA)
        .union(AceMask::APPEND_DATA);

    /// Bits granted by the `read` level
    pub const READ: AceMask = AceMask::READ_DATA;

    /// Requests satisfied by a read permission
    pub const READ_CLASS: AceMask = AceMask::READ_DATA
        .union(AceMask::READ_NAMED_ATTRS)
        .union(AceMask::EXECUTE)
        .union(AceMask::READ_ATTRIBUTES)
        .union(AceMask::READ_ACL)
        .union(AceMask::SYNCHRONIZE);

    /// Requests satisfied by a write permission
    pub const WRITE_CLASS: AceMask = AceMask::READ_CLASS
        .union(AceMask::WRITE_DATA)
        .union(AceMask::APPEND_DATA)
        .union(AceMask::WRITE_NAMED_ATTRS)
        .union(AceMask::DELETE_CHILD)
        .union(AceMask::WRITE_ATTRIBUTES)
        .union(AceMask::DELETE);

    /// Attribute and ACL reads and writes
    pub const ATTRIBUTE_CLASS: AceMask = AceMask::READ_ATTRIBUTES
        .union(AceMask::WRITE_ATTRIBUTES)
        .union(AceMask::READ_ACL)
        .union(AceMask::WRITE_ACL);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AceType {
    Allowed = 0,
    Denied = 1,
    Audit = 2,
    Alarm = 3,
}

/// A protocol access control entry. `who` is the decimal uid, or gid when
///  [`AceFlags::IDENTIFIER_GROUP`] is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ace {
    pub who: String,
    pub ace_type: AceType,
    pub flags: AceFlags,
    pub mask: AceMask,
}

impl Ace {
    pub fn allow(who: impl Into<String>, flags: AceFlags, mask: AceMask) -> Self {
        Self {
            who: who.into(),
            ace_type: AceType::Allowed,
            flags,
            mask,
        }
    }

    pub fn is_group(&self) -> bool {
        self.flags.contains(AceFlags::IDENTIFIER_GROUP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessDecision {
    Allow,
    Deny,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

pub fn mask_for_level(level: PermissionLevel) -> AceMask {
    match level {
        PermissionLevel::Own => AceMask::OWN,
        PermissionLevel::Write => AceMask::WRITE,
        PermissionLevel::Read => AceMask::READ,
    }
}

/// Strongest level a mask can express; owner change wins over write,
///  write over read.
pub fn level_for_mask(mask: AceMask) -> Option<PermissionLevel> {
    if mask.contains(AceMask::WRITE_OWNER) {
        Some(PermissionLevel::Own)
    } else if mask.intersects(AceMask::WRITE_DATA | AceMask::APPEND_DATA) {
        Some(PermissionLevel::Write)
    } else if mask.contains(AceMask::READ_DATA) {
        Some(PermissionLevel::Read)
    } else {
        None
    }
}

/// One ALLOW entry per permission
pub fn to_protocol_acl(entries: &[PermissionEntry], ids: &IdMapper) -> Vec<Ace> {
    entries
        .iter()
        .map(|entry| {
            let mask = mask_for_level(entry.level);
            match entry.kind {
                SubjectKind::Group => Ace::allow(
                    ids.gid_for_name(&entry.name).to_string(),
                    AceFlags::IDENTIFIER_GROUP,
                    mask,
                ),
                SubjectKind::Individual => Ace::allow(
                    ids.uid_for_name(&entry.name).to_string(),
                    AceFlags::empty(),
                    mask,
                ),
            }
        })
        .collect()
}

fn subject_name(ace: &Ace, ids: &IdMapper) -> Option<String> {
    match ace.who.parse::<u32>() {
        Ok(id) if ace.is_group() => ids.name_for_gid(id),
        Ok(id) => ids.name_for_uid(id),
        Err(_) => Some(ace.who.clone()),
    }
}

/// Translate an incoming ACE, or `None` when it cannot be represented.
pub async fn to_permission_entry(
    ace: &Ace,
    ids: &IdMapper,
    session: &dyn Session,
) -> Result<Option<PermissionEntry>, BackendError> {
    if ace.ace_type != AceType::Allowed {
        tracing::debug!(who = %ace.who, ace_type = ?ace.ace_type, "dropping non-allow ACE");
        return Ok(None);
    }

    let Some(name) = subject_name(ace, ids) else {
        tracing::warn!(who = %ace.who, "dropping ACE for unmapped principal");
        return Ok(None);
    };

    let Some(level) = level_for_mask(ace.mask) else {
        tracing::debug!(who = %ace.who, mask = ?ace.mask, "dropping ACE without a representable level");
        return Ok(None);
    };

    let Some(user) = session.find_user(&name).await? else {
        tracing::warn!(name, "dropping ACE for account unknown to the backend");
        return Ok(None);
    };

    let kind = if ace.is_group() {
        SubjectKind::Group
    } else {
        SubjectKind::Individual
    };
    Ok(Some(PermissionEntry::new(user.name, kind, user.zone, level)))
}

/// Changes needed to turn `current` into `incoming`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclDiff {
    pub added: Vec<PermissionEntry>,
    pub removed: Vec<PermissionEntry>,
}

/// The owner keeps `own`: its entry is never removed, and a grant of a
///  lower level to the owner is dropped since granting replaces the level.
pub fn diff_acl(current: &[PermissionEntry], incoming: &[PermissionEntry], owner: &str) -> AclDiff {
    let removed = current
        .iter()
        .filter(|e| !incoming.contains(e))
        .filter(|e| !(e.name == owner && e.level == PermissionLevel::Own))
        .cloned()
        .collect();
    let added = incoming
        .iter()
        .filter(|e| !current.contains(e))
        .filter(|e| {
            let downgrade = e.name == owner
                && e.kind == SubjectKind::Individual
                && e.level < PermissionLevel::Own;
            if downgrade {
                tracing::debug!(owner, level = %e.level, "keeping owner at own");
            }
            !downgrade
        })
        .cloned()
        .collect();
    AclDiff { added, removed }
}

/// Highest level `user` holds directly or through one of `groups`
pub fn effective_level(
    entries: &[PermissionEntry],
    user: &str,
    groups: &[String],
) -> Option<PermissionLevel> {
    entries
        .iter()
        .filter(|e| e.name == user || groups.iter().any(|g| *g == e.name))
        .map(|e| e.level)
        .max()
}

/// Paths that are always traversable: the store root, the zone root and
///  the zone's home, public and trash collections.
pub fn is_structural_path(path: &Path, zone: &str) -> bool {
    let zone_root = Path::new("/").join(zone);
    path == Path::new("/")
        || path == zone_root
        || path == zone_root.join("home")
        || path == zone_root.join("public")
        || path == zone_root.join("trash")
}

const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

/// POSIX mode for an object as seen by a caller holding `level`
pub fn compute_mode(kind: ObjectKind, structural: bool, level: Option<PermissionLevel>) -> u32 {
    if structural || kind == ObjectKind::SyntheticCollection {
        return S_IFDIR | 0o700;
    }

    let permission_bits = match level {
        Some(PermissionLevel::Own) | Some(PermissionLevel::Write) => 0o600,
        Some(PermissionLevel::Read) => 0o400,
        None => 0,
    };

    if kind.is_collection() {
        S_IFDIR | 0o100 | permission_bits
    } else {
        (S_IFREG | permission_bits) & !0o111
    }
}

/// The mask asks for nothing beyond traversal
pub fn is_traversal_only(mask: AceMask) -> bool {
    !mask.is_empty() && AceMask::EXECUTE.contains(mask)
}

/// The mask asks for nothing beyond attribute or ACL access
pub fn is_attribute_only(mask: AceMask) -> bool {
    !mask.is_empty() && AceMask::ATTRIBUTE_CLASS.contains(mask)
}

/// Final step of the access decision, from the caller's permission level
pub fn level_decision(level: Option<PermissionLevel>, mask: AceMask) -> AccessDecision {
    let allowed = match level {
        Some(PermissionLevel::Own) => true,
        Some(PermissionLevel::Write) => AceMask::WRITE_CLASS.contains(mask),
        Some(PermissionLevel::Read) => AceMask::READ_CLASS.contains(mask),
        None => false,
    };
    if allowed {
        AccessDecision::Allow
    } else {
        AccessDecision::Deny
    }
}
