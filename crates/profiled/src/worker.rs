//! The Replication Worker: executes a claimed `NeighborhoodAction` against
//! local storage, talking to the remote neighbor only when the action
//! doesn't already carry its payload inline.

use crate::action_queue::now_millis;
use crate::protocol::BatchItem;
use crate::storage::Storage;
use crate::validator::{validate_signed_profile, SentinelPolicy};
use profile_core::types::{
    ActionType, HostedIdentity, IdentityId, NeighborhoodAction, ServerId, SignedProfile, Version,
    WireStatus,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("neighbor communication failed: {0}")]
    Neighbor(#[from] anyhow::Error),
    #[error("malformed additional_data payload: {0}")]
    MalformedPayload(String),
    #[error("action carried no target identity")]
    MissingTarget,
    #[error("bulk import exceeded its safety deadline")]
    DeadlineExceeded,
    /// The follower's own reply names an unrecoverable divergence: our view
    /// and theirs no longer agree and retrying cannot fix it. The caller
    /// deletes the follower.
    #[error("follower rejected replication: {0:?}")]
    FollowerRejected(WireStatus),
}

type Result<T> = std::result::Result<T, WorkerError>;

/// Fetches data from a remote neighbor. The production implementation talks
/// over `profile-net`'s framed connection to the neighbor interface port;
/// tests substitute an in-memory fake.
pub trait NeighborClient {
    async fn list_all_profiles(&self, server_id: ServerId) -> anyhow::Result<Vec<SignedProfile>>;
}

/// Delivers a single replication item to a follower's neighbor-interface
/// port. The production implementation is the same framed connection
/// `NeighborClient` uses, pointed the other direction; tests substitute an
/// in-memory fake.
pub trait FollowerClient {
    async fn push_items(&self, items: Vec<BatchItem>) -> anyhow::Result<WireStatus>;
}

pub fn encode_profile_payload(signed: &SignedProfile) -> Result<String> {
    let bytes = postcard::to_allocvec(signed)
        .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
    Ok(hex::encode(bytes))
}

pub fn decode_profile_payload(payload: &str) -> Result<SignedProfile> {
    let bytes = hex::decode(payload).map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
    postcard::from_bytes(&bytes).map_err(|e| WorkerError::MalformedPayload(e.to_string()))
}

/// A profile whose origin failed to deliver valid data during import; the
/// slot is held with the sentinel type until a later RefreshProfiles
/// succeeds.
fn placeholder_identity(identity_id: IdentityId) -> HostedIdentity {
    let profile = profile_core::types::Profile {
        version: Version::CURRENT,
        public_key: identity_id.0.to_vec(),
        type_: profile_core::types::INTERNAL_INVALID_PROFILE_TYPE.into(),
        name: String::new(),
        location: profile_core::types::Location::NONE,
        extra_data: String::new(),
        profile_image_hash: vec![],
        thumbnail_image_hash: vec![],
        no_propagation: false,
    };
    HostedIdentity {
        identity_id,
        signed_profile: SignedProfile { profile, signature: vec![] },
        initialized: false,
    }
}

pub struct Worker {
    storage: Arc<Storage>,
    add_neighbor_safety_margin: Duration,
}

impl Worker {
    pub fn new(storage: Arc<Storage>, add_neighbor_safety_margin: Duration) -> Self {
        Worker { storage, add_neighbor_safety_margin }
    }

    /// Execute a claimed action, returning a soft/hard outcome to the
    /// action queue. `reservation_deadline` is when the caller's claim on
    /// this action's `(ServerId, class)` pair expires; bulk imports must
    /// finish `add_neighbor_safety_margin` before that to leave room for
    /// the queue to detect and recover from a stuck worker.
    pub async fn execute<C: NeighborClient>(
        &self,
        action: &NeighborhoodAction,
        client: &C,
        reservation_deadline: std::time::Instant,
    ) -> Result<()> {
        match action.action_type {
            ActionType::AddNeighbor | ActionType::RefreshProfiles => {
                self.bulk_import(action.server_id, client, reservation_deadline).await
            }
            ActionType::RemoveNeighbor => self.remove_neighbor(action.server_id),
            ActionType::StopNeighborhoodUpdates => Ok(()),
            ActionType::AddProfile | ActionType::ChangeProfile => {
                self.upsert_profile(action.server_id, &action.additional_data)
            }
            ActionType::RemoveProfile => self.remove_profile(action.server_id, action),
            ActionType::InitializationProcessInProgress => Ok(()),
        }
    }

    async fn bulk_import<C: NeighborClient>(
        &self,
        server_id: ServerId,
        client: &C,
        reservation_deadline: std::time::Instant,
    ) -> Result<()> {
        let deadline = reservation_deadline
            .checked_sub(self.add_neighbor_safety_margin)
            .unwrap_or(reservation_deadline);

        let fetch = client.list_all_profiles(server_id);
        let timeout = deadline.saturating_duration_since(std::time::Instant::now());
        let profiles = tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| WorkerError::DeadlineExceeded)??;

        // Validate every fetched profile into memory first; nothing is
        // written to storage until the whole batch has been built, so a
        // timeout or error partway through leaves zero rows written.
        let mut identities = Vec::with_capacity(profiles.len());
        for signed in profiles {
            let identity_id = signed.identity_id();
            let identity = match validate_signed_profile(&signed, &identity_id, SentinelPolicy::Reject) {
                Ok(()) => HostedIdentity { identity_id, signed_profile: signed, initialized: true },
                Err(_) => placeholder_identity(identity_id),
            };
            identities.push(identity);
        }

        for identity in &identities {
            self.storage.put_neighbor_identity(&server_id, identity)?;
        }

        if let Some(mut neighbor) = self.storage.get_neighbor(&server_id)? {
            neighbor.last_refresh_time = Some(now_millis());
            neighbor.shared_profiles_count = self.storage.count_neighbor_identities(&server_id) as u64;
            self.storage.put_neighbor(&neighbor)?;
        }
        Ok(())
    }

    fn remove_neighbor(&self, server_id: ServerId) -> Result<()> {
        self.storage.remove_all_neighbor_identities(&server_id)?;
        self.storage.remove_neighbor(&server_id)?;
        Ok(())
    }

    fn upsert_profile(&self, server_id: ServerId, payload: &str) -> Result<()> {
        let signed = decode_profile_payload(payload)?;
        let identity_id = signed.identity_id();
        let identity = match validate_signed_profile(&signed, &identity_id, SentinelPolicy::Reject) {
            Ok(()) => HostedIdentity { identity_id, signed_profile: signed, initialized: true },
            Err(_) => placeholder_identity(identity_id),
        };
        self.storage.put_neighbor_identity(&server_id, &identity)?;
        Ok(())
    }

    fn remove_profile(&self, server_id: ServerId, action: &NeighborhoodAction) -> Result<()> {
        let target = action.target_identity_id.ok_or(WorkerError::MissingTarget)?;
        self.storage.remove_neighbor_identity(&server_id, &target)?;
        Ok(())
    }

    /// Push a single AddProfile/ChangeProfile/RemoveProfile action to the
    /// follower it targets, and apply the follower-reply status table.
    pub async fn push_to_follower<C: FollowerClient>(
        &self,
        action: &NeighborhoodAction,
        client: &C,
    ) -> Result<()> {
        let item = match action.action_type {
            ActionType::RemoveProfile => {
                let target = action.target_identity_id.ok_or(WorkerError::MissingTarget)?;
                BatchItem::Delete(target)
            }
            ActionType::AddProfile | ActionType::ChangeProfile => {
                let target = action.target_identity_id.ok_or(WorkerError::MissingTarget)?;
                match self.storage.get_hosted_identity(&target)? {
                    Some(identity) => BatchItem::Update(identity.signed_profile),
                    // Hosting was cancelled between enqueue and execution.
                    None if action.action_type == ActionType::ChangeProfile => return Ok(()),
                    None => BatchItem::Update(placeholder_identity(target).signed_profile),
                }
            }
            other => return Err(WorkerError::MalformedPayload(format!("{other:?} is not a follower-push action"))),
        };

        match client.push_items(vec![item]).await? {
            WireStatus::Ok => Ok(()),
            WireStatus::ErrorBadRole => {
                self.reset_follower_port(action.server_id)?;
                Err(WorkerError::Neighbor(anyhow::anyhow!(
                    "follower reports our cached neighbor port is stale"
                )))
            }
            status => Err(WorkerError::FollowerRejected(status)),
        }
    }

    fn reset_follower_port(&self, server_id: ServerId) -> Result<()> {
        if let Some(mut follower) = self.storage.get_follower(&server_id)? {
            follower.0.sr_neighbor_port = None;
            self.storage.put_follower(&follower)?;
        }
        Ok(())
    }
}
