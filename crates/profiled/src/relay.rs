//! The Relay: bridges a caller to a callee identity currently checked in on
//! this server, through a five-state handshake.
//!
//! `WaitingForCalleeResponse` -> (callee accepts) -> `WaitingForFirstInitMessage`
//! -> (caller presents its token) -> `WaitingForSecondInitMessage` -> (callee
//! presents its token) -> `Open`, with `Destroyed` reachable from any state.

use crate::registry::{ClientRegistry, ConnectionId, RegistryError, RelayRole};
use profile_core::types::{CalleeToken, CallerToken, IdentityId, RelayId, RelayStatus, WireStatus};
use profile_net::{Envelope, MessageKind};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("callee identity is not currently available")]
    CalleeNotAvailable,
    #[error("relay is not in the expected state")]
    WrongState,
    #[error("relay was rejected or timed out")]
    Destroyed,
    #[error("token does not match this relay")]
    TokenMismatch,
    #[error("this connection is not bound to an open relay")]
    NotBound,
    #[error("the other end of this relay has no application-service connection")]
    PeerNotConnected,
    #[error("the forwarded message's ack channel was dropped")]
    AckLost,
}

type Result<T> = std::result::Result<T, RelayError>;

pub struct RelayTimings {
    pub callee_response_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for RelayTimings {
    fn default() -> Self {
        RelayTimings {
            callee_response_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(30),
        }
    }
}

/// Request a new relay to `callee_identity`; fails if the callee is not
/// checked in on this server right now. Pushes an incoming-call notification
/// to the callee's checked-in connection; a failure to deliver that push is
/// not itself fatal to relay creation, since the callee may simply answer
/// from a freshly reconnected session before the response timeout.
pub fn request_relay(
    registry: &ClientRegistry,
    caller_identity: IdentityId,
    callee_identity: IdentityId,
) -> Result<RelayId> {
    let callee_conn = registry.find_checked_in(&callee_identity).ok_or(RelayError::CalleeNotAvailable)?;
    let relay = registry.create_relay(caller_identity, callee_identity);

    let notification = crate::protocol::Request::IncomingCallNotification {
        relay_id: relay.id,
        caller_identity,
    };
    if let Ok(payload) = postcard::to_allocvec(&notification) {
        let _ = registry.push(callee_conn, Envelope { id: 0, kind: MessageKind::Request, payload });
    }
    Ok(relay.id)
}

/// The callee has responded to the incoming call request. On accept, the
/// `CallerToken` is pushed to the caller's checked-in connection as
/// `Request::RelayAccepted` — this is the only place that token is ever
/// delivered. On rejection, a `RelayFailed { ErrorRejected }` notification is
/// pushed to the caller instead. Neither push's delivery affects the relay's
/// state transition; a caller that is no longer checked in simply never
/// receives it.
pub fn callee_respond(registry: &ClientRegistry, relay_id: RelayId, accept: bool) -> Result<()> {
    let relay = registry.get_relay(&relay_id)?;
    if relay.status != RelayStatus::WaitingForCalleeResponse {
        return Err(RelayError::WrongState);
    }
    if accept {
        registry.set_relay_status(&relay_id, RelayStatus::WaitingForFirstInitMessage)?;
        push_to_caller(
            registry,
            &relay,
            crate::protocol::Request::RelayAccepted { relay_id, caller_token: relay.caller_token },
        );
    } else {
        registry.destroy_relay(&relay_id);
        push_to_caller(
            registry,
            &relay,
            crate::protocol::Request::RelayFailed { relay_id, status: WireStatus::ErrorRejected },
        );
    }
    Ok(())
}

/// Best-effort push of a relay notification to the caller's checked-in
/// connection. A caller no longer checked in, or an encoding failure, is
/// silently dropped — this is notification, not a guaranteed delivery.
fn push_to_caller(registry: &ClientRegistry, relay: &crate::registry::RelayConnection, request: crate::protocol::Request) {
    if let Some(caller_conn) = registry.find_checked_in(&relay.caller_identity) {
        if let Ok(payload) = postcard::to_allocvec(&request) {
            let _ = registry.push(caller_conn, Envelope { id: 0, kind: MessageKind::Request, payload });
        }
    }
}

/// The caller sends its init message, presenting the token it was issued,
/// from the application-service connection `conn` that will carry its end
/// of the conversation from now on.
pub fn caller_init(
    registry: &ClientRegistry,
    relay_id: RelayId,
    token: CallerToken,
    conn: ConnectionId,
) -> Result<()> {
    let relay = registry.get_relay(&relay_id)?;
    if relay.status == RelayStatus::Destroyed {
        return Err(RelayError::Destroyed);
    }
    if relay.status != RelayStatus::WaitingForFirstInitMessage {
        return Err(RelayError::WrongState);
    }
    if relay.caller_token != token {
        registry.destroy_relay(&relay_id);
        return Err(RelayError::TokenMismatch);
    }
    registry.set_relay_connection(&relay_id, RelayRole::Caller, conn)?;
    registry.bind_relay_membership(conn, relay_id, RelayRole::Caller);
    registry.set_relay_status(&relay_id, RelayStatus::WaitingForSecondInitMessage)?;
    Ok(())
}

/// The callee sends its init message, presenting the token it was issued.
/// Once this succeeds the relay is `Open` and both ends may exchange
/// application messages in order, each acknowledged before the next is sent.
pub fn callee_init(
    registry: &ClientRegistry,
    relay_id: RelayId,
    token: CalleeToken,
    conn: ConnectionId,
) -> Result<()> {
    let relay = registry.get_relay(&relay_id)?;
    if relay.status == RelayStatus::Destroyed {
        return Err(RelayError::Destroyed);
    }
    if relay.status != RelayStatus::WaitingForSecondInitMessage {
        return Err(RelayError::WrongState);
    }
    if relay.callee_token != token {
        registry.destroy_relay(&relay_id);
        return Err(RelayError::TokenMismatch);
    }
    registry.set_relay_connection(&relay_id, RelayRole::Callee, conn)?;
    registry.bind_relay_membership(conn, relay_id, RelayRole::Callee);
    registry.set_relay_status(&relay_id, RelayStatus::Open)?;
    Ok(())
}

/// Forward an application payload from `sender` to the other end of the
/// relay it is bound to, and await that end's ack. The relay enforces one
/// unfinished request at a time implicitly: the sender's own connection
/// handling loop blocks on this call before accepting its next message.
pub async fn forward_message(
    registry: &ClientRegistry,
    sender: ConnectionId,
    payload: Vec<u8>,
) -> Result<WireStatus> {
    let (relay_id, role) = registry.relay_membership(&sender).ok_or(RelayError::NotBound)?;
    let relay = registry.get_relay(&relay_id)?;
    if relay.status != RelayStatus::Open {
        return Err(RelayError::WrongState);
    }
    let recipient = match role {
        RelayRole::Caller => relay.callee_conn,
        RelayRole::Callee => relay.caller_conn,
    }
    .ok_or(RelayError::PeerNotConnected)?;

    let (push_id, ack_rx) = registry.register_push();
    let notification = crate::protocol::Request::ReceiveMessageNotification { payload };
    let body = postcard::to_allocvec(&notification).map_err(|_| RelayError::PeerNotConnected)?;
    registry.push(recipient, Envelope { id: push_id, kind: MessageKind::Request, payload: body })?;

    ack_rx.await.map_err(|_| RelayError::AckLost)
}

pub fn close(registry: &ClientRegistry, relay_id: RelayId) {
    registry.destroy_relay(&relay_id);
    registry.remove_relay(&relay_id);
}

/// Destroy relays that have outlived their handshake timing budget: a relay
/// still waiting for the callee's response after `callee_response_timeout`,
/// or still waiting for an init message after `init_timeout`. Each destroyed
/// relay's caller is pushed a `RelayFailed { ErrorNotAvailable }`
/// notification before the relay is removed.
pub fn sweep_expired(registry: &ClientRegistry, timings: &RelayTimings) -> usize {
    let waiting_for_response = registry.stale_relays(timings.callee_response_timeout);
    let waiting_for_init = registry.stale_relays(timings.init_timeout);
    let mut expired: Vec<_> = waiting_for_response;
    expired.extend(waiting_for_init);
    expired.sort();
    expired.dedup();
    for id in &expired {
        if let Ok(relay) = registry.get_relay(id) {
            push_to_caller(
                registry,
                &relay,
                crate::protocol::Request::RelayFailed { relay_id: *id, status: WireStatus::ErrorNotAvailable },
            );
        }
        registry.destroy_relay(id);
        registry.remove_relay(id);
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRole;

    const CALLER: IdentityId = IdentityId([3; 32]);

    fn registry_with_checked_in_callee() -> (ClientRegistry, IdentityId) {
        let registry = ClientRegistry::new();
        let callee = IdentityId([4; 32]);
        let conn = registry.allocate_connection_id();
        registry.add_connection(conn, "127.0.0.1:1".parse().unwrap(), ConnectionRole::Client);
        registry.check_in(callee, conn);
        (registry, callee)
    }

    /// Checks `identity` in on a fresh connection with an outbound channel
    /// registered, so pushes addressed to it can be observed.
    fn check_in_with_outbound(
        registry: &ClientRegistry,
        identity: IdentityId,
    ) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
        let conn = registry.allocate_connection_id();
        registry.add_connection(conn, "127.0.0.1:2".parse().unwrap(), ConnectionRole::Client);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_outbound(conn, tx);
        registry.check_in(identity, conn);
        rx
    }

    #[test]
    fn full_handshake_opens_relay() {
        let (registry, callee) = registry_with_checked_in_callee();
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        let relay = registry.get_relay(&relay_id).unwrap();

        let caller_conn = registry.allocate_connection_id();
        let callee_conn = registry.allocate_connection_id();

        callee_respond(&registry, relay_id, true).unwrap();
        caller_init(&registry, relay_id, relay.caller_token, caller_conn).unwrap();
        callee_init(&registry, relay_id, relay.callee_token, callee_conn).unwrap();

        assert_eq!(registry.get_relay(&relay_id).unwrap().status, RelayStatus::Open);
        assert_eq!(registry.relay_membership(&caller_conn), Some((relay_id, RelayRole::Caller)));
        assert_eq!(registry.relay_membership(&callee_conn), Some((relay_id, RelayRole::Callee)));
    }

    #[test]
    fn callee_rejection_destroys_relay() {
        let (registry, callee) = registry_with_checked_in_callee();
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        callee_respond(&registry, relay_id, false).unwrap();
        assert_eq!(registry.get_relay(&relay_id).unwrap().status, RelayStatus::Destroyed);
    }

    #[test]
    fn wrong_caller_token_destroys_relay() {
        let (registry, callee) = registry_with_checked_in_callee();
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        callee_respond(&registry, relay_id, true).unwrap();

        let bogus = CallerToken(uuid::Uuid::new_v4());
        let conn = registry.allocate_connection_id();
        let err = caller_init(&registry, relay_id, bogus, conn).unwrap_err();
        assert!(matches!(err, RelayError::TokenMismatch));
        assert_eq!(registry.get_relay(&relay_id).unwrap().status, RelayStatus::Destroyed);
    }

    #[test]
    fn unavailable_callee_is_rejected_up_front() {
        let registry = ClientRegistry::new();
        let err = request_relay(&registry, CALLER, IdentityId([9; 32])).unwrap_err();
        assert!(matches!(err, RelayError::CalleeNotAvailable));
    }

    #[test]
    fn callee_accept_pushes_token_to_caller() {
        let (registry, callee) = registry_with_checked_in_callee();
        let mut caller_rx = check_in_with_outbound(&registry, CALLER);
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        let relay = registry.get_relay(&relay_id).unwrap();

        callee_respond(&registry, relay_id, true).unwrap();

        let pushed = caller_rx.try_recv().expect("caller should have been pushed a token");
        let request: crate::protocol::Request = postcard::from_bytes(&pushed.payload).unwrap();
        match request {
            crate::protocol::Request::RelayAccepted { relay_id: id, caller_token } => {
                assert_eq!(id, relay_id);
                assert_eq!(caller_token, relay.caller_token);
            }
            other => panic!("unexpected push: {other:?}"),
        }
    }

    #[test]
    fn callee_rejection_notifies_caller() {
        let (registry, callee) = registry_with_checked_in_callee();
        let mut caller_rx = check_in_with_outbound(&registry, CALLER);
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();

        callee_respond(&registry, relay_id, false).unwrap();

        let pushed = caller_rx.try_recv().expect("caller should have been notified of rejection");
        let request: crate::protocol::Request = postcard::from_bytes(&pushed.payload).unwrap();
        match request {
            crate::protocol::Request::RelayFailed { relay_id: id, status } => {
                assert_eq!(id, relay_id);
                assert_eq!(status, WireStatus::ErrorRejected);
            }
            other => panic!("unexpected push: {other:?}"),
        }
    }

    #[test]
    fn sweep_expired_notifies_caller() {
        let (registry, callee) = registry_with_checked_in_callee();
        let mut caller_rx = check_in_with_outbound(&registry, CALLER);
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();

        let timings = RelayTimings { callee_response_timeout: Duration::from_secs(0), init_timeout: Duration::from_secs(0) };
        std::thread::sleep(Duration::from_millis(5));
        let count = sweep_expired(&registry, &timings);
        assert_eq!(count, 1);

        let pushed = caller_rx.try_recv().expect("caller should have been notified of timeout");
        let request: crate::protocol::Request = postcard::from_bytes(&pushed.payload).unwrap();
        match request {
            crate::protocol::Request::RelayFailed { relay_id: id, status } => {
                assert_eq!(id, relay_id);
                assert_eq!(status, WireStatus::ErrorNotAvailable);
            }
            other => panic!("unexpected push: {other:?}"),
        }
        assert!(registry.get_relay(&relay_id).is_err());
    }

    #[tokio::test]
    async fn forward_message_delivers_and_awaits_ack() {
        let (registry, callee) = registry_with_checked_in_callee();
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        let relay = registry.get_relay(&relay_id).unwrap();

        let caller_conn = registry.allocate_connection_id();
        let callee_conn = registry.allocate_connection_id();
        let (callee_tx, mut callee_rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_outbound(callee_conn, callee_tx);

        callee_respond(&registry, relay_id, true).unwrap();
        caller_init(&registry, relay_id, relay.caller_token, caller_conn).unwrap();
        callee_init(&registry, relay_id, relay.callee_token, callee_conn).unwrap();

        let registry = std::sync::Arc::new(registry);
        let send_registry = registry.clone();
        let sender = tokio::spawn(async move {
            forward_message(&send_registry, caller_conn, vec![1, 2, 3]).await
        });

        let pushed = callee_rx.recv().await.unwrap();
        assert!(registry.complete_push(pushed.id, WireStatus::Ok));

        let status = sender.await.unwrap().unwrap();
        assert_eq!(status, WireStatus::Ok);
    }

    #[tokio::test]
    async fn forward_message_requires_open_relay() {
        let (registry, callee) = registry_with_checked_in_callee();
        let relay_id = request_relay(&registry, CALLER, callee).unwrap();
        let _ = relay_id;
        let conn = registry.allocate_connection_id();
        let err = forward_message(&registry, conn, vec![]).await.unwrap_err();
        assert!(matches!(err, RelayError::NotBound));
    }
}
