use log::warn;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub struct ChildEntry<T> {
    pub ino: u64,
    pub node: Arc<T>,
}

impl<T> Clone for ChildEntry<T> {
    fn clone(&self) -> Self {
        Self {
            ino: self.ino,
            node: self.node.clone(),
        }
    }
}

/// A container child that mirrors one remote entity.
pub trait SyncedChild: Send + Sync + 'static {
    type Remote: Send;

    /// Identity of a listed entity (val id, blob key).
    fn remote_key(remote: &Self::Remote) -> String;
    /// Name the entity gets inside its container.
    fn remote_file_name(remote: &Self::Remote) -> String;

    fn key(&self) -> String;
    fn is_stale(&self, remote: &Self::Remote) -> bool;
    /// Busy children hold local changes that are still being pushed; a
    /// refresh must leave them alone.
    fn is_busy(&self) -> bool {
        false
    }
    fn replace_snapshot(&self, remote: Self::Remote);
}

/// Inode bookkeeping for children entering or leaving a container.
pub trait ChildSink<T: SyncedChild> {
    fn attach(&self, remote: T::Remote) -> ChildEntry<T>;
    fn detach(&self, name: &str, entry: &ChildEntry<T>);
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    pub added: Vec<String>,
    /// `(name, ino)` of children whose snapshot was replaced.
    pub updated: Vec<(String, u64)>,
    pub removed: Vec<String>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} updated={} removed={}",
            self.added.len(),
            self.updated.len(),
            self.removed.len()
        )
    }
}

/// Brings `children` in line with the authoritative `remote` listing.
/// Existing inodes survive as long as their entity keeps its key and name.
pub fn reconcile<T, S>(
    children: &mut BTreeMap<String, ChildEntry<T>>,
    remote: Vec<T::Remote>,
    sink: &S,
) -> RefreshReport
where
    T: SyncedChild,
    S: ChildSink<T> + ?Sized,
{
    let mut report = RefreshReport::default();
    let mut present: HashMap<String, String> = HashMap::with_capacity(remote.len());
    let mut names: HashSet<String> = HashSet::with_capacity(remote.len());

    for entity in remote {
        let key = T::remote_key(&entity);
        let name = T::remote_file_name(&entity);
        if let Some(other) = present.get(&key) {
            warn!("remote listing repeats {} (as {} and {})", key, other, name);
            continue;
        }
        if !names.insert(name.clone()) {
            warn!("remote listing maps two entities to {}, keeping the first", name);
            continue;
        }
        present.insert(key.clone(), name.clone());

        match children.get(&name) {
            None => {
                let entry = sink.attach(entity);
                children.insert(name.clone(), entry);
                report.added.push(name);
            }
            Some(existing) if existing.node.is_busy() => {}
            Some(existing) if existing.node.key() != key => {
                let old = existing.clone();
                sink.detach(&name, &old);
                let entry = sink.attach(entity);
                children.insert(name.clone(), entry);
                report.removed.push(name.clone());
                report.added.push(name);
            }
            Some(existing) => {
                if existing.node.is_stale(&entity) {
                    existing.node.replace_snapshot(entity);
                    report.updated.push((name, existing.ino));
                }
            }
        }
    }

    let gone: Vec<String> = children
        .iter()
        .filter(|(name, entry)| {
            present.get(&entry.node.key()) != Some(*name) && !entry.node.is_busy()
        })
        .map(|(name, _)| name.clone())
        .collect();
    for name in gone {
        if let Some(entry) = children.remove(&name) {
            sink.detach(&name, &entry);
            report.removed.push(name);
        }
    }

    report
}
