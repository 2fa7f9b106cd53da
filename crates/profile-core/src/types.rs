//! Core data model: identities, neighborhood peers, actions, relays, and
//! relationship cards.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// LIMITS
// =============================================================================

pub const MAX_PUBLIC_KEY_BYTES: usize = 128;
pub const MAX_NAME_BYTES: usize = 64;
pub const MAX_TYPE_BYTES: usize = 64;
pub const MAX_EXTRA_DATA_BYTES: usize = 2048;
pub const HASH_LENGTH: usize = 32;
pub const NETWORK_IDENTIFIER_LENGTH: usize = 32;
pub const MAX_HOSTED_IDENTITIES: usize = 100_000;
pub const CARD_IDENTIFIER_LENGTH: usize = 32;

/// Sentinel `Type` value that may be substituted exactly once, used by a
/// follower to hold a profile's slot when the origin failed to deliver a
/// valid record during bulk import.
pub const INTERNAL_INVALID_PROFILE_TYPE: &str = "InternalInvalidProfileType";

// =============================================================================
// VERSION
// =============================================================================

/// Semantic version triple. Only {1,0,0} is accepted for new data.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const CURRENT: Version = Version { major: 1, minor: 0, patch: 0 };

    pub fn is_current(&self) -> bool {
        *self == Self::CURRENT
    }
}

// =============================================================================
// LOCATION
// =============================================================================

/// Fixed-point degrees: one unit is 1e-6 degree ("microdegree").
pub const LOCATION_FIXED_POINT_SCALE: i64 = 1_000_000;

/// Sentinel encoding meaning "no location set".
pub const NO_LOCATION: i32 = i32::MIN;

/// Signed fixed-point latitude/longitude.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub latitude: i32,
    pub longitude: i32,
}

impl Location {
    pub const NONE: Location = Location { latitude: NO_LOCATION, longitude: NO_LOCATION };

    pub fn is_none(&self) -> bool {
        self.latitude == NO_LOCATION && self.longitude == NO_LOCATION
    }

    /// Either the sentinel, or both coordinates within their valid ranges
    /// (latitude in [-90, 90] degrees, longitude in [-180, 180] degrees).
    pub fn is_valid(&self) -> bool {
        if self.is_none() {
            return true;
        }
        let lat_bound = 90 * LOCATION_FIXED_POINT_SCALE;
        let lon_bound = 180 * LOCATION_FIXED_POINT_SCALE;
        (self.latitude as i64).abs() <= lat_bound && (self.longitude as i64).abs() <= lon_bound
    }

    fn degrees(&self) -> (f64, f64) {
        (
            self.latitude as f64 / LOCATION_FIXED_POINT_SCALE as f64,
            self.longitude as f64 / LOCATION_FIXED_POINT_SCALE as f64,
        )
    }

    /// Great-circle distance to `other`, in meters, via the haversine formula.
    pub fn distance_meters(&self, other: &Location) -> f64 {
        const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
        let (lat1, lon1) = self.degrees();
        let (lat2, lon2) = other.degrees();
        let (lat1, lon1, lat2, lon2) =
            (lat1.to_radians(), lon1.to_radians(), lat2.to_radians(), lon2.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_METERS * c
    }
}

// =============================================================================
// PROFILE / IDENTITY
// =============================================================================

/// IdentityId: SHA-256(PublicKey).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityId(pub Bytes32);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The signable content of a profile: every field the Ed25519 signature
/// covers. IdentityId is not part of this struct because it is derived
/// from `public_key`, not carried alongside it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub version: Version,
    pub public_key: Vec<u8>,
    pub type_: String,
    pub name: String,
    pub location: Location,
    pub extra_data: String,
    pub profile_image_hash: Vec<u8>,
    pub thumbnail_image_hash: Vec<u8>,
    /// Once set true, this identity's updates stop propagating to followers;
    /// the flag itself is one-way and may not be cleared by a later update.
    pub no_propagation: bool,
}

impl Profile {
    pub fn is_sentinel_type(&self) -> bool {
        self.type_ == INTERNAL_INVALID_PROFILE_TYPE
    }
}

/// A profile plus its Ed25519 signature over `canonical_bytes(profile)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedProfile {
    pub profile: Profile,
    pub signature: Vec<u8>,
}

impl SignedProfile {
    /// IdentityId == SHA-256(PublicKey), recomputed from the carried key.
    pub fn identity_id(&self) -> IdentityId {
        crate::crypto::identity_id_from_public_key(&self.profile.public_key)
    }
}

/// A hosted or neighbor-shared identity as kept in storage: the signed
/// profile plus whether it has completed its first (initializing) update.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HostedIdentity {
    pub identity_id: IdentityId,
    pub signed_profile: SignedProfile,
    pub initialized: bool,
}

// =============================================================================
// NEIGHBOR / FOLLOWER
// =============================================================================

/// 32-byte network identifier for a peer profile server.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub Bytes32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Common record shape for a remote profile server we share profiles with.
/// `Neighbor` (we import from them) and `Follower` (they import from us)
/// wrap this identically-shaped record in distinct newtypes so the two
/// relations cannot be confused at the type level.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerServer {
    pub server_id: ServerId,
    pub ip_address: std::net::IpAddr,
    pub primary_port: u16,
    pub sr_neighbor_port: Option<u16>,
    pub location: Location,
    /// Unix milliseconds; absent until neighborhood initialization completes.
    pub last_refresh_time: Option<u64>,
    pub shared_profiles_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Neighbor(pub PeerServer);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Follower(pub PeerServer);

impl std::ops::Deref for Neighbor {
    type Target = PeerServer;
    fn deref(&self) -> &PeerServer {
        &self.0
    }
}
impl std::ops::DerefMut for Neighbor {
    fn deref_mut(&mut self) -> &mut PeerServer {
        &mut self.0
    }
}
impl std::ops::Deref for Follower {
    type Target = PeerServer;
    fn deref(&self) -> &PeerServer {
        &self.0
    }
}
impl std::ops::DerefMut for Follower {
    fn deref_mut(&mut self) -> &mut PeerServer {
        &mut self.0
    }
}

// =============================================================================
// NEIGHBORHOOD ACTION
// =============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionType {
    AddNeighbor,
    RemoveNeighbor,
    StopNeighborhoodUpdates,
    AddProfile,
    ChangeProfile,
    RemoveProfile,
    RefreshProfiles,
    InitializationProcessInProgress,
}

/// Actions that carry a TargetIdentityId are profile actions; the rest
/// target the peer server itself.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Profile,
    Server,
}

impl ActionType {
    pub fn class(&self) -> ActionClass {
        match self {
            ActionType::AddProfile
            | ActionType::ChangeProfile
            | ActionType::RemoveProfile
            | ActionType::RefreshProfiles => ActionClass::Profile,
            ActionType::AddNeighbor
            | ActionType::RemoveNeighbor
            | ActionType::StopNeighborhoodUpdates
            | ActionType::InitializationProcessInProgress => ActionClass::Server,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NeighborhoodAction {
    pub id: u64,
    pub server_id: ServerId,
    pub action_type: ActionType,
    pub target_identity_id: Option<IdentityId>,
    /// Unix milliseconds; None means ready now.
    pub execute_after: Option<u64>,
    pub timestamp: u64,
    pub additional_data: String,
}

impl NeighborhoodAction {
    pub fn class(&self) -> ActionClass {
        self.action_type.class()
    }
}

// =============================================================================
// RELAY
// =============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RelayId(pub Uuid);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CallerToken(pub Uuid);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CalleeToken(pub Uuid);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayStatus {
    WaitingForCalleeResponse,
    WaitingForFirstInitMessage,
    WaitingForSecondInitMessage,
    Open,
    Destroyed,
}

// =============================================================================
// WIRE-LEVEL STATUS
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WireStatus {
    Ok,
    ErrorProtocolViolation,
    ErrorInvalidValue { details: String },
    ErrorInvalidSignature,
    ErrorNotFound,
    ErrorNotAvailable,
    ErrorRejected,
    ErrorBusy,
    ErrorBadRole,
    ErrorInternal,
}

impl WireStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, WireStatus::Ok)
    }
}

// =============================================================================
// RELATIONSHIP CARD
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelationshipCard {
    /// SHA-256 of the card with this field zeroed, per the card invariant.
    pub card_id: Bytes32,
    pub version: Version,
    pub issuer_public_key: Vec<u8>,
    pub recipient_public_key: Vec<u8>,
    pub card_type: String,
    /// Unix milliseconds.
    pub valid_from: u64,
    /// Unix milliseconds.
    pub valid_to: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedRelationshipCard {
    pub card: RelationshipCard,
    pub issuer_signature: Vec<u8>,
}

/// The application sub-record attached to a relationship-card-bearing
/// request; its CardId must match the card's own CardId.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CardApplication {
    pub card_id: Bytes32,
    pub application_id: Vec<u8>,
}
