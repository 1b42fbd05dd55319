//! Handle to path mapping for the protocol engine
//!
//! The protocol identifies objects by fixed-width handles while the backend
//! is addressed by path. This module keeps the bidirectional mapping between
//! them. Both directions live behind one lock so they can never disagree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub type Handle = u64;

/// Handle of the configured mount point
pub const ROOT_HANDLE: Handle = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InodeMapError {
    #[error("handle {handle} is already mapped to {}", .existing.display())]
    AlreadyMapped { handle: Handle, existing: PathBuf },

    #[error("path {} is already mapped to handle {existing}", .path.display())]
    PathTaken { path: PathBuf, existing: Handle },

    #[error("handle {handle} is not mapped to {}", .path.display())]
    InvalidMapping { handle: Handle, path: PathBuf },

    #[error("cannot move {} below itself", .0.display())]
    MoveIntoSelf(PathBuf),
}

#[derive(Debug)]
struct Tables {
    path_to_inode: HashMap<PathBuf, Handle>,
    inode_to_path: HashMap<Handle, PathBuf>,
    next_inode: Handle,
}

impl Tables {
    /// Next handle that has never been handed out and is not mapped
    fn allocate(&mut self) -> Handle {
        while self.inode_to_path.contains_key(&self.next_inode) {
            self.next_inode += 1;
        }
        let handle = self.next_inode;
        self.next_inode += 1;
        handle
    }

    fn check_pair(&self, handle: Handle, path: &Path) -> Result<(), InodeMapError> {
        match self.inode_to_path.get(&handle) {
            Some(current) if current == path => Ok(()),
            _ => Err(InodeMapError::InvalidMapping {
                handle,
                path: path.to_path_buf(),
            }),
        }
    }

    /// Mapped `(handle, path)` pairs at or below `root`
    fn subtree(&self, root: &Path) -> Vec<(Handle, PathBuf)> {
        self.path_to_inode
            .iter()
            .filter(|(path, _)| path.starts_with(root))
            .map(|(path, handle)| (*handle, path.clone()))
            .collect()
    }

    fn remove_pair(&mut self, handle: Handle, path: &Path) {
        self.inode_to_path.remove(&handle);
        self.path_to_inode.remove(path);
    }
}

fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Bidirectional handle/path registry.
///
/// Handles are allocated monotonically and retired once unmapped, so a stale
/// handle held by a client can never alias a different object.
pub struct InodeMap {
    tables: RwLock<Tables>,
}

impl InodeMap {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                path_to_inode: HashMap::new(),
                inode_to_path: HashMap::new(),
                next_inode: ROOT_HANDLE + 1, // 1 is reserved for the root
            }),
        }
    }

    /// Map the root handle onto the mount point
    pub fn establish_root(&self, mount_point: &Path) -> Result<Handle, InodeMapError> {
        self.map(ROOT_HANDLE, mount_point)?;
        Ok(ROOT_HANDLE)
    }

    /// Reserve a fresh handle without mapping it
    pub fn allocate(&self) -> Handle {
        self.tables.write().allocate()
    }

    /// Map `handle` to `path`. Mapping an existing pair again is a no-op.
    pub fn map(&self, handle: Handle, path: &Path) -> Result<(), InodeMapError> {
        let mut tables = self.tables.write();

        let previous = tables.inode_to_path.insert(handle, path.to_path_buf());
        if let Some(existing) = previous.as_ref().filter(|p| p.as_path() != path) {
            let existing = existing.clone();
            tables.inode_to_path.insert(handle, existing.clone());
            return Err(InodeMapError::AlreadyMapped { handle, existing });
        }

        if let Some(&existing) = tables.path_to_inode.get(path) {
            if existing != handle {
                // roll back the handle side so neither table changed
                match previous {
                    Some(p) => tables.inode_to_path.insert(handle, p),
                    None => tables.inode_to_path.remove(&handle),
                };
                return Err(InodeMapError::PathTaken {
                    path: path.to_path_buf(),
                    existing,
                });
            }
        }

        tables.path_to_inode.insert(path.to_path_buf(), handle);
        // explicitly mapped handles are never allocated again
        tables.next_inode = tables.next_inode.max(handle.saturating_add(1));
        Ok(())
    }

    /// Handle for `path`, allocating and mapping a new one on first sight
    pub fn handle_for(&self, path: &Path) -> Handle {
        if let Some(handle) = self.handle_of(path) {
            return handle;
        }

        let mut tables = self.tables.write();
        if let Some(&handle) = tables.path_to_inode.get(path) {
            return handle;
        }
        let handle = tables.allocate();
        tables.path_to_inode.insert(path.to_path_buf(), handle);
        tables.inode_to_path.insert(handle, path.to_path_buf());
        handle
    }

    /// Remove the mapping. Fails without side effects if `handle` is not
    ///  currently mapped to exactly `path`.
    pub fn unmap(&self, handle: Handle, path: &Path) -> Result<(), InodeMapError> {
        let mut tables = self.tables.write();
        tables.check_pair(handle, path)?;
        tables.remove_pair(handle, path);
        Ok(())
    }

    /// Point `handle` at `new_path`, keeping the handle.
    pub fn remap(&self, handle: Handle, old_path: &Path, new_path: &Path) -> Result<(), InodeMapError> {
        let mut tables = self.tables.write();
        tables.check_pair(handle, old_path)?;
        if let Some(&existing) = tables.path_to_inode.get(new_path) {
            if existing != handle {
                return Err(InodeMapError::PathTaken {
                    path: new_path.to_path_buf(),
                    existing,
                });
            }
        }

        tables.path_to_inode.remove(old_path);
        tables.path_to_inode.insert(new_path.to_path_buf(), handle);
        tables.inode_to_path.insert(handle, new_path.to_path_buf());
        Ok(())
    }

    /// Remap `handle` and every mapped descendant of `old_path` under
    ///  `new_path`. Either every mapping moves or none does.
    pub fn remap_tree(
        &self,
        handle: Handle,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<(), InodeMapError> {
        if new_path.starts_with(old_path) && new_path != old_path {
            return Err(InodeMapError::MoveIntoSelf(old_path.to_path_buf()));
        }

        let mut tables = self.tables.write();
        tables.check_pair(handle, old_path)?;

        let moving = tables.subtree(old_path);
        for (_, path) in &moving {
            let target = rebase(path, old_path, new_path);
            if let Some(&existing) = tables.path_to_inode.get(&target) {
                if !moving.iter().any(|(h, _)| *h == existing) {
                    return Err(InodeMapError::PathTaken {
                        path: target,
                        existing,
                    });
                }
            }
        }

        for (h, path) in &moving {
            tables.remove_pair(*h, path);
        }
        for (h, path) in moving {
            let target = rebase(&path, old_path, new_path);
            tables.path_to_inode.insert(target.clone(), h);
            tables.inode_to_path.insert(h, target);
        }
        Ok(())
    }

    /// Fails if moving `from` onto `to` could not be reflected in the registry
    pub fn check_move(&self, from: &Path, to: &Path) -> Result<(), InodeMapError> {
        if to.starts_with(from) && to != from {
            return Err(InodeMapError::MoveIntoSelf(from.to_path_buf()));
        }
        let tables = self.tables.read();
        if let Some(&handle) = tables.path_to_inode.get(from) {
            tables.check_pair(handle, from)?;
        }
        Ok(())
    }

    /// Reflect a completed backend move: whatever was mapped at or below
    ///  `to` is unmapped, then the handle at `from` (if any) and its mapped
    ///  descendants are remapped onto `to`. Returns the moved handle.
    pub fn move_tree(&self, from: &Path, to: &Path) -> Result<Option<Handle>, InodeMapError> {
        if to.starts_with(from) && to != from {
            return Err(InodeMapError::MoveIntoSelf(from.to_path_buf()));
        }

        let mut tables = self.tables.write();
        for (h, path) in tables.subtree(to) {
            tables.remove_pair(h, &path);
        }

        let moved = tables.path_to_inode.get(from).copied();
        for (h, path) in tables.subtree(from) {
            tables.remove_pair(h, &path);
            let target = rebase(&path, from, to);
            tables.path_to_inode.insert(target.clone(), h);
            tables.inode_to_path.insert(h, target);
        }
        Ok(moved)
    }

    pub fn path_of(&self, handle: Handle) -> Option<PathBuf> {
        self.tables.read().inode_to_path.get(&handle).cloned()
    }

    pub fn handle_of(&self, path: &Path) -> Option<Handle> {
        self.tables.read().path_to_inode.get(path).copied()
    }

    /// Number of mapped handles
    pub fn len(&self) -> usize {
        self.tables.read().inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All mapped pairs, ordered by handle
    pub fn entries(&self) -> Vec<(Handle, PathBuf)> {
        let tables = self.tables.read();
        let mut entries: Vec<_> = tables
            .inode_to_path
            .iter()
            .map(|(h, p)| (*h, p.clone()))
            .collect();
        entries.sort();
        entries
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(map: &InodeMap) {
        for (handle, path) in map.entries() {
            assert_eq!(map.handle_of(&path), Some(handle));
            assert_eq!(map.path_of(handle), Some(path));
        }
    }

    #[test]
    fn test_root_is_handle_one() {
        let map = InodeMap::new();
        assert_eq!(map.establish_root(Path::new("/z/home")).unwrap(), ROOT_HANDLE);
        assert_eq!(map.path_of(ROOT_HANDLE), Some(PathBuf::from("/z/home")));
        assert_eq!(map.allocate(), 2);
    }

    #[test]
    fn test_handle_for_is_stable() {
        let map = InodeMap::new();
        let a = map.handle_for(Path::new("/z/a"));
        let b = map.handle_for(Path::new("/z/b"));
        assert_ne!(a, b);
        assert_eq!(map.handle_for(Path::new("/z/a")), a);
        assert_consistent(&map);
    }

    #[test]
    fn test_map_conflict_rolls_back() {
        let map = InodeMap::new();
        map.map(5, Path::new("/z/a")).unwrap();
        let before = map.entries();

        let err = map.map(6, Path::new("/z/a")).unwrap_err();
        assert!(matches!(err, InodeMapError::PathTaken { existing: 5, .. }));
        assert_eq!(map.path_of(6), None);

        let err = map.map(5, Path::new("/z/b")).unwrap_err();
        assert!(matches!(err, InodeMapError::AlreadyMapped { handle: 5, .. }));
        assert_eq!(map.entries(), before);
    }

    #[test]
    fn test_explicit_map_advances_allocator() {
        let map = InodeMap::new();
        map.map(2, Path::new("/z/a")).unwrap();
        map.map(7, Path::new("/z/c")).unwrap();

        let b = map.handle_for(Path::new("/z/b"));
        assert!(b > 7);
        assert_eq!(map.path_of(2), Some(PathBuf::from("/z/a")));
        assert_eq!(map.handle_of(Path::new("/z/a")), Some(2));
        assert!(map.allocate() > b);
        assert_consistent(&map);
    }

    #[test]
    fn test_unmap_mismatch_changes_nothing() {
        let map = InodeMap::new();
        let h = map.handle_for(Path::new("/z/a"));
        map.handle_for(Path::new("/z/b"));
        let before = map.entries();

        let err = map.unmap(h, Path::new("/z/b")).unwrap_err();
        assert!(matches!(err, InodeMapError::InvalidMapping { .. }));
        assert_eq!(map.entries(), before);

        map.unmap(h, Path::new("/z/a")).unwrap();
        assert_eq!(map.path_of(h), None);
        assert_eq!(map.handle_of(Path::new("/z/a")), None);
    }

    #[test]
    fn test_unmapped_handles_are_retired() {
        let map = InodeMap::new();
        let h = map.handle_for(Path::new("/z/a"));
        map.unmap(h, Path::new("/z/a")).unwrap();
        let again = map.handle_for(Path::new("/z/a"));
        assert!(again > h);
    }

    #[test]
    fn test_remap_keeps_handle() {
        let map = InodeMap::new();
        let h = map.handle_for(Path::new("/z/a"));
        map.remap(h, Path::new("/z/a"), Path::new("/z/b")).unwrap();
        assert_eq!(map.handle_of(Path::new("/z/b")), Some(h));
        assert_eq!(map.handle_of(Path::new("/z/a")), None);

        let other = map.handle_for(Path::new("/z/c"));
        let err = map.remap(h, Path::new("/z/b"), Path::new("/z/c")).unwrap_err();
        assert!(matches!(err, InodeMapError::PathTaken { existing, .. } if existing == other));
        assert_consistent(&map);
    }

    #[test]
    fn test_remap_tree_moves_descendants() {
        let map = InodeMap::new();
        let dir = map.handle_for(Path::new("/z/a"));
        let child = map.handle_for(Path::new("/z/a/f"));
        let grandchild = map.handle_for(Path::new("/z/a/d/g"));
        let sibling = map.handle_for(Path::new("/z/ab"));

        map.remap_tree(dir, Path::new("/z/a"), Path::new("/z/b")).unwrap();

        assert_eq!(map.path_of(dir), Some(PathBuf::from("/z/b")));
        assert_eq!(map.path_of(child), Some(PathBuf::from("/z/b/f")));
        assert_eq!(map.path_of(grandchild), Some(PathBuf::from("/z/b/d/g")));
        assert_eq!(map.path_of(sibling), Some(PathBuf::from("/z/ab")));
        assert_consistent(&map);
    }

    #[test]
    fn test_remap_tree_conflict_is_atomic() {
        let map = InodeMap::new();
        let dir = map.handle_for(Path::new("/z/a"));
        map.handle_for(Path::new("/z/a/f"));
        map.handle_for(Path::new("/z/b/f"));
        let before = map.entries();

        assert!(map
            .remap_tree(dir, Path::new("/z/a"), Path::new("/z/b"))
            .is_err());
        assert_eq!(map.entries(), before);
    }

    #[test]
    fn test_move_tree_displaces_destination() {
        let map = InodeMap::new();
        let src = map.handle_for(Path::new("/z/a"));
        let stale = map.handle_for(Path::new("/z/b"));

        let moved = map.move_tree(Path::new("/z/a"), Path::new("/z/b")).unwrap();
        assert_eq!(moved, Some(src));
        assert_eq!(map.handle_of(Path::new("/z/b")), Some(src));
        assert_eq!(map.path_of(stale), None);
        assert_consistent(&map);

        assert!(map.check_move(Path::new("/z/b"), Path::new("/z/b/c")).is_err());
    }

    #[test]
    fn test_concurrent_handle_for() {
        let map = std::sync::Arc::new(InodeMap::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let map = map.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|n| map.handle_for(Path::new(&format!("/z/{}", (n + i) % 50))))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(map.len(), 50);
        assert_consistent(&map);
    }
}
