//! Bounded LRU of session ciphers with two lookup paths.
//!
//! One entry per peer identity holds that peer's outbound session (used to
//! encrypt to it) and inbound session (used to decrypt from it). Entries are
//! found either by identity or by the exact encrypted key blob of the inbound
//! session, which is how a receiver recognises an already-verified session
//! without any RSA work.
//!
//! Entries live in an arena of slots addressed by stable indices. Both maps
//! and the recency list store indices, never references, so evicting an entry
//! is a matter of unlinking one slot and removing its keys from both maps.
//!
//! # Invariants
//!
//! - Every blob key maps to a slot whose inbound session carries exactly that
//!   blob, and that slot's identity maps back to the same slot.
//! - Every occupied slot is on the recency list exactly once.
//! - `len() <= capacity()` after every public operation.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;

use crate::cipher::CipherSession;

type Handle = usize;

struct Entry {
    identity: String,
    inbound: Option<Arc<CipherSession>>,
    outbound: Option<Arc<CipherSession>>,
    /// Towards most recently used
    prev: Option<Handle>,
    /// Towards least recently used
    next: Option<Handle>,
}

/// Dual-index LRU cache of [`CipherSession`]s.
pub struct CipherCache {
    slots: Vec<Option<Entry>>,
    free: Vec<Handle>,
    /// Most recently used
    head: Option<Handle>,
    /// Least recently used
    tail: Option<Handle>,
    by_identity: HashMap<String, Handle>,
    by_blob: HashMap<Bytes, Handle>,
    capacity: usize,
}

impl CipherCache {
    /// Cache holding at most `capacity` peers (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            by_identity: HashMap::new(),
            by_blob: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of cached peers.
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    /// True if no peers are cached.
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Maximum number of cached peers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions for `identity` as `(inbound, outbound)`. Marks it recently
    /// used.
    pub fn get_by_peer(
        &mut self,
        identity: &str,
    ) -> Option<(Option<Arc<CipherSession>>, Option<Arc<CipherSession>>)> {
        let handle = *self.by_identity.get(identity)?;
        self.touch(handle);
        let entry = self.entry(handle)?;
        Some((entry.inbound.clone(), entry.outbound.clone()))
    }

    /// Outbound session for `identity`. Marks it recently used.
    pub fn outbound(&mut self, identity: &str) -> Option<Arc<CipherSession>> {
        self.get_by_peer(identity).and_then(|(_, outbound)| outbound)
    }

    /// Inbound session whose encrypted key blob is exactly `blob`. Marks its
    /// peer recently used.
    pub fn get_by_encrypted_blob(&mut self, blob: &[u8]) -> Option<Arc<CipherSession>> {
        let handle = *self.by_blob.get(blob)?;
        self.touch(handle);
        self.entry(handle)?.inbound.clone()
    }

    /// Insert or merge sessions for `identity`.
    ///
    /// A direction passed as `None` keeps whatever the entry already holds.
    /// Replacing an inbound session drops the old session's blob key. The
    /// entry becomes most recently used; the least recently used entry is
    /// evicted if the cache is over capacity.
    pub fn put(
        &mut self,
        identity: &str,
        inbound: Option<Arc<CipherSession>>,
        outbound: Option<Arc<CipherSession>>,
    ) {
        let handle = match self.by_identity.get(identity) {
            Some(&handle) => {
                self.touch(handle);
                handle
            },
            None => self.allocate(identity),
        };

        if let Some(inbound) = inbound {
            let blob = inbound.encrypted_cipher().clone();
            let previous = self.entry_mut(handle).and_then(|e| e.inbound.replace(inbound));
            if let Some(previous) = previous
                && previous.encrypted_cipher() != &blob
            {
                self.by_blob.remove(previous.encrypted_cipher());
            }
            // Same blob previously seen under another identity.
            if let Some(stale) = self.by_blob.insert(blob, handle)
                && stale != handle
                && let Some(entry) = self.entry_mut(stale)
            {
                entry.inbound = None;
            }
        }
        if let Some(outbound) = outbound
            && let Some(entry) = self.entry_mut(handle)
        {
            entry.outbound = Some(outbound);
        }

        while self.by_identity.len() > self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Remove `identity` from both indices.
    pub fn delete(&mut self, identity: &str) -> bool {
        match self.by_identity.get(identity) {
            Some(&handle) => {
                self.remove(handle);
                true
            },
            None => false,
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.by_identity.clear();
        self.by_blob.clear();
    }

    /// Identities from most to least recently used.
    pub fn identities(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            match self.entry(handle) {
                Some(entry) => {
                    out.push(entry.identity.clone());
                    cursor = entry.next;
                },
                None => break,
            }
        }
        out
    }

    /// Number of blob keys currently indexed.
    pub fn blob_count(&self) -> usize {
        self.by_blob.len()
    }

    /// Check every structural invariant. Used by tests and debug assertions.
    ///
    /// # Errors
    ///
    /// A description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.by_identity.len() > self.capacity {
            return Err(format!("{} entries exceed capacity {}", self.len(), self.capacity));
        }
        for (blob, &handle) in &self.by_blob {
            let entry = self.entry(handle).ok_or("blob key points at empty slot")?;
            let inbound = entry.inbound.as_ref().ok_or("blob key points at entry without inbound")?;
            if inbound.encrypted_cipher() != blob {
                return Err("blob key does not match inbound session".to_string());
            }
            if self.by_identity.get(&entry.identity) != Some(&handle) {
                return Err(format!("blob key for {} unreachable by identity", entry.identity));
            }
        }
        for (identity, &handle) in &self.by_identity {
            let entry = self.entry(handle).ok_or("identity points at empty slot")?;
            if &entry.identity != identity {
                return Err(format!("identity {identity} points at entry for {}", entry.identity));
            }
        }
        let listed = self.identities();
        if listed.len() != self.by_identity.len() {
            return Err(format!(
                "recency list has {} entries, index has {}",
                listed.len(),
                self.by_identity.len()
            ));
        }
        Ok(())
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        self.slots.get(handle).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.slots.get_mut(handle).and_then(Option::as_mut)
    }

    fn allocate(&mut self, identity: &str) -> Handle {
        let entry = Entry {
            identity: identity.to_string(),
            inbound: None,
            outbound: None,
            prev: None,
            next: None,
        };
        let handle = match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = Some(entry);
                handle
            },
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            },
        };
        self.by_identity.insert(identity.to_string(), handle);
        self.push_front(handle);
        handle
    }

    fn touch(&mut self, handle: Handle) {
        if self.head != Some(handle) {
            self.unlink(handle);
            self.push_front(handle);
        }
    }

    fn push_front(&mut self, handle: Handle) {
        let old_head = self.head;
        if let Some(entry) = self.entry_mut(handle) {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(old) = old_head {
            if let Some(entry) = self.entry_mut(old) {
                entry.prev = Some(handle);
            }
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }

    fn unlink(&mut self, handle: Handle) {
        let Some((prev, next)) = self.entry(handle).map(|e| (e.prev, e.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(entry) = self.entry_mut(p) {
                    entry.next = next;
                }
            },
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = self.entry_mut(n) {
                    entry.prev = prev;
                }
            },
            None => self.tail = prev,
        }
        if let Some(entry) = self.entry_mut(handle) {
            entry.prev = None;
            entry.next = None;
        }
    }

    fn remove(&mut self, handle: Handle) {
        self.unlink(handle);
        let Some(entry) = self.slots.get_mut(handle).and_then(Option::take) else {
            return;
        };
        self.by_identity.remove(&entry.identity);
        if let Some(inbound) = &entry.inbound
            && self.by_blob.get(inbound.encrypted_cipher()) == Some(&handle)
        {
            self.by_blob.remove(inbound.encrypted_cipher());
        }
        self.free.push(handle);
    }

    fn evict_lru(&mut self) -> bool {
        let Some(tail) = self.tail else {
            return false;
        };
        if let Some(entry) = self.entry(tail) {
            tracing::trace!(identity = %entry.identity, "evicting cached cipher");
        }
        self.remove(tail);
        true
    }
}
