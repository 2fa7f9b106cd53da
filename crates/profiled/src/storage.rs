//! Persistent storage using sled.
//!
//! One named tree per table: hosted identities, identities imported from a
//! neighbor, our neighbors, our followers, the neighborhood action queue, and
//! a content-addressed image blob store shared by both profile and thumbnail
//! images.

use profile_core::types::{
    Follower, HostedIdentity, IdentityId, Neighbor, NeighborhoodAction, ServerId,
};
use sled::Db;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

type Result<T> = std::result::Result<T, StorageError>;

/// Image bytes plus the number of profiles currently referencing them, so a
/// shared thumbnail/profile image is only deleted once nothing points at it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct ImageBlob {
    bytes: Vec<u8>,
    refcount: u64,
}

/// A (ServerId, IdentityId) pair used to key identities imported from a
/// specific neighbor: the same IdentityId can legitimately appear under
/// more than one neighbor if two neighbors both host it.
fn neighbor_identity_key(server_id: &ServerId, identity_id: &IdentityId) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(&server_id.0);
    key[32..].copy_from_slice(&identity_id.0);
    key
}

pub struct Storage {
    db: Db,
    hosted_identities: sled::Tree,
    neighbor_identities: sled::Tree,
    neighbors: sled::Tree,
    followers: sled::Tree,
    actions: sled::Tree,
    images: sled::Tree,
    metadata: sled::Tree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            hosted_identities: db.open_tree("hosted_identities")?,
            neighbor_identities: db.open_tree("neighbor_identities")?,
            neighbors: db.open_tree("neighbors")?,
            followers: db.open_tree("followers")?,
            actions: db.open_tree("actions")?,
            images: db.open_tree("images")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- hosted identities ---------------------------------------------

    pub fn put_hosted_identity(&self, identity: &HostedIdentity) -> Result<()> {
        let value = postcard::to_allocvec(identity)?;
        self.hosted_identities.insert(identity.identity_id.0, value)?;
        Ok(())
    }

    pub fn get_hosted_identity(&self, id: &IdentityId) -> Result<Option<HostedIdentity>> {
        match self.hosted_identities.get(id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_hosted_identity(&self, id: &IdentityId) -> Result<bool> {
        Ok(self.hosted_identities.contains_key(id.0)?)
    }

    pub fn remove_hosted_identity(&self, id: &IdentityId) -> Result<()> {
        self.hosted_identities.remove(id.0)?;
        Ok(())
    }

    pub fn hosted_identity_count(&self) -> usize {
        self.hosted_identities.len()
    }

    pub fn iter_hosted_identities(&self) -> impl Iterator<Item = Result<HostedIdentity>> + '_ {
        self.hosted_identities.iter().map(|r| {
            let (_, bytes) = r?;
            Ok(postcard::from_bytes(&bytes)?)
        })
    }

    // -- identities imported from a neighbor -----------------------------

    pub fn put_neighbor_identity(
        &self,
        server_id: &ServerId,
        identity: &HostedIdentity,
    ) -> Result<()> {
        let key = neighbor_identity_key(server_id, &identity.identity_id);
        let value = postcard::to_allocvec(identity)?;
        self.neighbor_identities.insert(&key[..], value)?;
        Ok(())
    }

    pub fn get_neighbor_identity(
        &self,
        server_id: &ServerId,
        identity_id: &IdentityId,
    ) -> Result<Option<HostedIdentity>> {
        let key = neighbor_identity_key(server_id, identity_id);
        match self.neighbor_identities.get(&key[..])? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_neighbor_identity(
        &self,
        server_id: &ServerId,
        identity_id: &IdentityId,
    ) -> Result<()> {
        let key = neighbor_identity_key(server_id, identity_id);
        self.neighbor_identities.remove(&key[..])?;
        Ok(())
    }

    /// Remove every identity imported from a given neighbor, used by the
    /// RemoveNeighbor cascade.
    pub fn remove_all_neighbor_identities(&self, server_id: &ServerId) -> Result<u64> {
        let mut removed = 0u64;
        for entry in self.neighbor_identities.scan_prefix(server_id.0) {
            let (key, _) = entry?;
            self.neighbor_identities.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn count_neighbor_identities(&self, server_id: &ServerId) -> usize {
        self.neighbor_identities.scan_prefix(server_id.0).count()
    }

    // -- neighbors / followers ------------------------------------------

    pub fn put_neighbor(&self, neighbor: &Neighbor) -> Result<()> {
        let value = postcard::to_allocvec(neighbor)?;
        self.neighbors.insert(neighbor.server_id.0, value)?;
        Ok(())
    }

    pub fn get_neighbor(&self, server_id: &ServerId) -> Result<Option<Neighbor>> {
        match self.neighbors.get(server_id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_neighbor(&self, server_id: &ServerId) -> Result<()> {
        self.neighbors.remove(server_id.0)?;
        Ok(())
    }

    pub fn iter_neighbors(&self) -> impl Iterator<Item = Result<Neighbor>> + '_ {
        self.neighbors.iter().map(|r| {
            let (_, bytes) = r?;
            Ok(postcard::from_bytes(&bytes)?)
        })
    }

    pub fn put_follower(&self, follower: &Follower) -> Result<()> {
        let value = postcard::to_allocvec(follower)?;
        self.followers.insert(follower.server_id.0, value)?;
        Ok(())
    }

    pub fn get_follower(&self, server_id: &ServerId) -> Result<Option<Follower>> {
        match self.followers.get(server_id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_follower(&self, server_id: &ServerId) -> Result<()> {
        self.followers.remove(server_id.0)?;
        Ok(())
    }

    pub fn iter_followers(&self) -> impl Iterator<Item = Result<Follower>> + '_ {
        self.followers.iter().map(|r| {
            let (_, bytes) = r?;
            Ok(postcard::from_bytes(&bytes)?)
        })
    }

    // -- neighborhood actions ---------------------------------------------

    pub fn put_action(&self, action: &NeighborhoodAction) -> Result<()> {
        let value = postcard::to_allocvec(action)?;
        self.actions.insert(action.id.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_action(&self, id: u64) -> Result<Option<NeighborhoodAction>> {
        match self.actions.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_action(&self, id: u64) -> Result<()> {
        self.actions.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Iterate actions in ascending Id order; big-endian keys make sled's
    /// natural byte ordering match numeric ordering.
    pub fn iter_actions(&self) -> impl Iterator<Item = Result<NeighborhoodAction>> + '_ {
        self.actions.iter().map(|r| {
            let (_, bytes) = r?;
            Ok(postcard::from_bytes(&bytes)?)
        })
    }

    pub fn next_action_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    // -- image blobs -------------------------------------------------------

    /// Store (or reference-count an existing) image under its content hash.
    pub fn acquire_image(&self, hash: &[u8; 32], bytes: &[u8]) -> Result<()> {
        let blob = match self.images.get(hash)? {
            Some(existing) => {
                let mut blob: ImageBlob = postcard::from_bytes(&existing)?;
                blob.refcount += 1;
                blob
            }
            None => ImageBlob { bytes: bytes.to_vec(), refcount: 1 },
        };
        self.images.insert(hash, postcard::to_allocvec(&blob)?)?;
        Ok(())
    }

    /// Drop one reference to an image; deletes the blob once refcount hits 0.
    pub fn release_image(&self, hash: &[u8; 32]) -> Result<()> {
        if let Some(existing) = self.images.get(hash)? {
            let mut blob: ImageBlob = postcard::from_bytes(&existing)?;
            if blob.refcount <= 1 {
                self.images.remove(hash)?;
            } else {
                blob.refcount -= 1;
                self.images.insert(hash, postcard::to_allocvec(&blob)?)?;
            }
        }
        Ok(())
    }

    pub fn get_image(&self, hash: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        match self.images.get(hash)? {
            Some(bytes) => {
                let blob: ImageBlob = postcard::from_bytes(&bytes)?;
                Ok(Some(blob.bytes))
            }
            None => Ok(None),
        }
    }

    pub fn has_image(&self, hash: &[u8; 32]) -> Result<bool> {
        Ok(self.images.contains_key(hash)?)
    }

    // -- metadata ------------------------------------------------------------

    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_core::types::{Location, Profile, SignedProfile, Version};
    use tempfile::tempdir;

    fn sample_identity(seed: u8) -> HostedIdentity {
        let profile = Profile {
            version: Version::CURRENT,
            public_key: vec![seed; 32],
            type_: "Person".into(),
            name: "Alice".into(),
            location: Location::NONE,
            extra_data: String::new(),
            profile_image_hash: vec![],
            thumbnail_image_hash: vec![],
            no_propagation: false,
        };
        let signed_profile = SignedProfile { profile, signature: vec![0; 64] };
        HostedIdentity {
            identity_id: signed_profile.identity_id(),
            signed_profile,
            initialized: true,
        }
    }

    #[test]
    fn hosted_identity_round_trip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let identity = sample_identity(1);

        storage.put_hosted_identity(&identity).unwrap();
        assert!(storage.has_hosted_identity(&identity.identity_id).unwrap());

        let fetched = storage.get_hosted_identity(&identity.identity_id).unwrap().unwrap();
        assert_eq!(fetched, identity);

        storage.remove_hosted_identity(&identity.identity_id).unwrap();
        assert!(!storage.has_hosted_identity(&identity.identity_id).unwrap());
    }

    #[test]
    fn neighbor_identity_cascade_removal() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let server_id = ServerId([9u8; 32]);

        for seed in 0..3u8 {
            storage.put_neighbor_identity(&server_id, &sample_identity(seed)).unwrap();
        }
        assert_eq!(storage.count_neighbor_identities(&server_id), 3);

        let removed = storage.remove_all_neighbor_identities(&server_id).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(storage.count_neighbor_identities(&server_id), 0);
    }

    #[test]
    fn image_refcounting() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let hash = [3u8; 32];

        storage.acquire_image(&hash, b"hello").unwrap();
        storage.acquire_image(&hash, b"hello").unwrap();
        assert!(storage.has_image(&hash).unwrap());

        storage.release_image(&hash).unwrap();
        assert!(storage.has_image(&hash).unwrap());

        storage.release_image(&hash).unwrap();
        assert!(!storage.has_image(&hash).unwrap());
    }

    #[test]
    fn action_queue_orders_by_id() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        for i in 0..3u64 {
            let action = NeighborhoodAction {
                id: i,
                server_id: ServerId([1u8; 32]),
                action_type: profile_core::types::ActionType::RefreshProfiles,
                target_identity_id: None,
                execute_after: None,
                timestamp: 0,
                additional_data: String::new(),
            };
            storage.put_action(&action).unwrap();
        }

        let ids: Vec<u64> = storage.iter_actions().map(|a| a.unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
