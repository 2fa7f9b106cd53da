//! Application-level request/response messages carried as the `payload` of
//! a `profile_net::Envelope`. One variant per operation exposed on the
//! client, app-service, or neighbor listeners.

use profile_core::types::{
    CalleeToken, CallerToken, IdentityId, Location, RelayId, SignedProfile, SignedRelationshipCard,
    WireStatus,
};
use serde::{Deserialize, Serialize};

/// One entry of a `SharedProfileUpdate` batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BatchItem {
    Update(SignedProfile),
    Delete(IdentityId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Client interface: mark an identity reachable for relay on this connection.
    CheckIn { identity_id: IdentityId },
    CheckOut { identity_id: IdentityId },
    GetProfile { identity_id: IdentityId },
    UpdateProfile { signed_profile: SignedProfile },
    RemoveProfile { identity_id: IdentityId },
    /// Apply several profile updates and removals as one request. Items run
    /// in order; the first invalid item aborts the whole batch with its own
    /// `{index}.update` / `{index}.delete` dotted path, and nothing is applied.
    SharedProfileUpdate { items: Vec<BatchItem> },
    SearchProfiles {
        name_filter: Option<String>,
        type_filter: Option<String>,
        /// Regular expression the profile's `extra_data` must match.
        extra_data_filter: Option<String>,
        /// Restrict results to within `radius_meters` of `near`; `near` must
        /// be set whenever this is.
        near: Option<Location>,
        radius_meters: Option<f64>,
        max_results: u32,
    },
    RequestRelay { callee_identity: IdentityId },
    CalleeRespond { relay_id: RelayId, accept: bool },
    CallerInit { relay_id: RelayId, token: CallerToken },
    CalleeInit { relay_id: RelayId, token: CalleeToken },
    /// Open-relay interface: forward a payload to the other end of the relay
    /// this connection is bound to. Resolved via connection membership, not
    /// a re-presented token.
    SendRelayMessage { payload: Vec<u8> },
    /// App-service interface: submit a relationship card for validation and storage.
    SubmitCard { signed_card: SignedRelationshipCard },
    /// Neighbor interface: bulk-export every profile hosted or re-shared by this server.
    ListProfiles,
    /// Server push: an incoming call notification delivered to a checked-in
    /// callee. Carries no reply obligation; the callee answers separately
    /// with CalleeRespond.
    IncomingCallNotification { relay_id: RelayId, caller_identity: IdentityId },
    /// Server push: the callee accepted the call. Delivered to the caller's
    /// checked-in connection with the token it must present via `CallerInit`.
    /// Carries no reply obligation.
    RelayAccepted { relay_id: RelayId, caller_token: CallerToken },
    /// Server push: the relay failed before reaching `Open` — the callee
    /// rejected it, it was not available, or it timed out waiting on a step.
    /// Delivered to the caller's checked-in connection. Carries no reply
    /// obligation.
    RelayFailed { relay_id: RelayId, status: WireStatus },
    /// Server push: a forwarded application message. The recipient answers
    /// with `Response::Status`, which the server correlates back to the
    /// sender's pending `SendRelayMessage` via the envelope id.
    ReceiveMessageNotification { payload: Vec<u8> },
    /// Server push: this connection's check-in has been superseded by a
    /// newer one for the same identity. No reply expected; the connection
    /// should drain and close.
    SessionSuperseded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Status(WireStatus),
    Profile(Option<SignedProfile>),
    Profiles(Vec<SignedProfile>),
    /// Immediate ack to `RequestRelay`: the relay was created and the callee
    /// has been notified. The caller's token arrives later, pushed as
    /// `Request::RelayAccepted` once the callee accepts.
    RelayPending { relay_id: RelayId },
}
