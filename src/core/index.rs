// Exact-duplicate index keyed by content hash.
//
// Most hashes belong to a single image, so a bucket starts as `Unique` and is
// promoted to a `Group` list only when a second image with the same hash
// shows up. Buckets hold record names; the catalog owns the records.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bucket {
    Unique(String),
    Group(Vec<String>),
}

impl Bucket {
    pub fn names(&self) -> &[String] {
        match self {
            Bucket::Unique(name) => std::slice::from_ref(name),
            Bucket::Group(names) => names,
        }
    }
}

#[derive(Debug, Default)]
pub struct DuplicateIndex {
    buckets: HashMap<String, Bucket>,
    groups: usize,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.groups = 0;
    }

    /// Record that `name` has content hash `hash`.
    pub fn insert(&mut self, hash: &str, name: &str) {
        let Some(bucket) = self.buckets.get_mut(hash) else {
            self.buckets
                .insert(hash.to_string(), Bucket::Unique(name.to_string()));
            return;
        };

        match bucket {
            Bucket::Unique(owner) => {
                if owner == name {
                    return;
                }
                let first = std::mem::take(owner);
                *bucket = Bucket::Group(vec![first, name.to_string()]);
                self.groups += 1;
            }
            Bucket::Group(names) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
    }

    /// Forget `name` under `hash`, demoting a group that drops to one member.
    pub fn remove(&mut self, hash: &str, name: &str) {
        let Some(bucket) = self.buckets.get_mut(hash) else {
            return;
        };

        match bucket {
            Bucket::Unique(owner) => {
                if owner == name {
                    self.buckets.remove(hash);
                }
            }
            Bucket::Group(names) => {
                names.retain(|n| n != name);
                if names.len() == 1 {
                    let last = names.remove(0);
                    *bucket = Bucket::Unique(last);
                    self.groups -= 1;
                }
            }
        }
    }

    pub fn get(&self, hash: &str) -> Option<&Bucket> {
        self.buckets.get(hash)
    }

    /// Names sharing `hash`, only when two or more images do.
    pub fn group(&self, hash: &str) -> Option<&[String]> {
        match self.buckets.get(hash) {
            Some(Bucket::Group(names)) => Some(names),
            _ => None,
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.buckets.iter().filter_map(|(hash, bucket)| match bucket {
            Bucket::Group(names) => Some((hash.as_str(), names.as_slice())),
            Bucket::Unique(_) => None,
        })
    }

    /// Number of hashes shared by two or more images.
    pub fn group_count(&self) -> usize {
        self.groups
    }

    /// Number of distinct content hashes.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
