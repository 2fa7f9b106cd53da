//! Client Registry: tracks live connections, which hosted identities are
//! currently reachable ("checked in") for relay requests, and in-flight
//! relay connections.

use parking_lot::RwLock;
use profile_core::types::{CalleeToken, CallerToken, IdentityId, RelayId, RelayStatus, WireStatus};
use profile_net::Envelope;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Which end of an Open relay a connection plays, once it has presented its
/// token on the application-service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayRole {
    Caller,
    Callee,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    AppService,
    Neighbor,
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub role: ConnectionRole,
    pub connected_at: Instant,
}

/// A relay connection bridging a caller and a callee through this server,
/// per its five-state handshake.
#[derive(Clone, Debug)]
pub struct RelayConnection {
    pub id: RelayId,
    pub caller_token: CallerToken,
    pub callee_token: CalleeToken,
    pub caller_identity: IdentityId,
    pub callee_identity: IdentityId,
    pub status: RelayStatus,
    pub created_at: Instant,
    /// Application-service connections bound to each end, once their Init
    /// message has been accepted.
    pub caller_conn: Option<ConnectionId>,
    pub callee_conn: Option<ConnectionId>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("relay {0:?} not found")]
    RelayNotFound(RelayId),
    #[error("identity is not checked in")]
    NotCheckedIn,
    #[error("connection is gone")]
    ConnectionGone,
}

type Result<T> = std::result::Result<T, RegistryError>;

pub struct ClientRegistry {
    next_connection_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    /// IdentityId -> the client-port connection currently representing it,
    /// i.e. available to be called through the Relay.
    checked_in: RwLock<HashMap<IdentityId, ConnectionId>>,
    relays: RwLock<HashMap<RelayId, RelayConnection>>,
    /// Channel used to push unsolicited envelopes (call notifications,
    /// forwarded relay messages) down an otherwise request/response connection.
    outbound: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Envelope>>>,
    /// Which relay, and which end of it, an application-service connection
    /// has bound itself to via its Init message.
    relay_membership: RwLock<HashMap<ConnectionId, (RelayId, RelayRole)>>,
    /// Forwarded messages awaiting the recipient's ack, keyed by push id.
    pending_pushes: RwLock<HashMap<u64, oneshot::Sender<WireStatus>>>,
    next_push_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            next_connection_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            checked_in: RwLock::new(HashMap::new()),
            relays: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            relay_membership: RwLock::new(HashMap::new()),
            pending_pushes: RwLock::new(HashMap::new()),
            next_push_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connection(&self, id: ConnectionId, addr: SocketAddr, role: ConnectionRole) {
        self.connections.write().insert(
            id,
            ConnectionInfo { id, addr, role, connected_at: Instant::now() },
        );
    }

    /// Remove a connection and, if it was the checked-in representative of
    /// an identity, remove that check-in too.
    pub fn remove_connection(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
        self.checked_in.write().retain(|_, v| *v != id);
        self.outbound.write().remove(&id);
        self.relay_membership.write().remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn register_outbound(&self, id: ConnectionId, tx: mpsc::UnboundedSender<Envelope>) {
        self.outbound.write().insert(id, tx);
    }

    /// Push an unsolicited envelope down a connection's write half.
    pub fn push(&self, id: ConnectionId, envelope: Envelope) -> Result<()> {
        let outbound = self.outbound.read();
        let tx = outbound.get(&id).ok_or(RegistryError::ConnectionGone)?;
        tx.send(envelope).map_err(|_| RegistryError::ConnectionGone)
    }

    pub fn bind_relay_membership(&self, conn: ConnectionId, relay_id: RelayId, role: RelayRole) {
        self.relay_membership.write().insert(conn, (relay_id, role));
    }

    pub fn relay_membership(&self, conn: &ConnectionId) -> Option<(RelayId, RelayRole)> {
        self.relay_membership.read().get(conn).copied()
    }

    /// Register a forwarded message awaiting its recipient's ack, returning
    /// the push id the recipient's response must echo and the receiver half
    /// the caller awaits on.
    pub fn register_push(&self) -> (u64, oneshot::Receiver<WireStatus>) {
        let id = self.next_push_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pushes.write().insert(id, tx);
        (id, rx)
    }

    /// Complete a pending push with the recipient's ack status. Returns
    /// `false` if no such push was pending (already timed out or unknown id).
    pub fn complete_push(&self, id: u64, status: WireStatus) -> bool {
        match self.pending_pushes.write().remove(&id) {
            Some(tx) => {
                let _ = tx.send(status);
                true
            }
            None => false,
        }
    }

    /// Check an identity in against `connection_id`. If another connection
    /// was already checked in as this identity, that earlier session is no
    /// longer authoritative; its connection id is returned so the caller can
    /// push it a close notification and let it drain.
    pub fn check_in(&self, identity_id: IdentityId, connection_id: ConnectionId) -> Option<ConnectionId> {
        let previous = self.checked_in.write().insert(identity_id, connection_id);
        previous.filter(|prev| *prev != connection_id)
    }

    pub fn check_out(&self, identity_id: &IdentityId) {
        self.checked_in.write().remove(identity_id);
    }

    pub fn find_checked_in(&self, identity_id: &IdentityId) -> Option<ConnectionId> {
        self.checked_in.read().get(identity_id).copied()
    }

    /// Reverse lookup: which identity, if any, is this connection currently
    /// checked in as.
    pub fn identity_of(&self, conn: &ConnectionId) -> Option<IdentityId> {
        self.checked_in.read().iter().find(|(_, v)| *v == conn).map(|(k, _)| *k)
    }

    pub fn checked_in_count(&self) -> usize {
        self.checked_in.read().len()
    }

    /// Allocate a new relay, generating fresh random tokens for both ends.
    pub fn create_relay(&self, caller_identity: IdentityId, callee_identity: IdentityId) -> RelayConnection {
        let relay = RelayConnection {
            id: RelayId(Uuid::new_v4()),
            caller_token: CallerToken(Uuid::new_v4()),
            callee_token: CalleeToken(Uuid::new_v4()),
            caller_identity,
            callee_identity,
            status: RelayStatus::WaitingForCalleeResponse,
            created_at: Instant::now(),
            caller_conn: None,
            callee_conn: None,
        };
        self.relays.write().insert(relay.id, relay.clone());
        relay
    }

    pub fn get_relay(&self, id: &RelayId) -> Result<RelayConnection> {
        self.relays.read().get(id).cloned().ok_or(RegistryError::RelayNotFound(*id))
    }

    pub fn set_relay_status(&self, id: &RelayId, status: RelayStatus) -> Result<()> {
        let mut relays = self.relays.write();
        let relay = relays.get_mut(id).ok_or(RegistryError::RelayNotFound(*id))?;
        relay.status = status;
        Ok(())
    }

    /// Bind an application-service connection to its end of the relay once
    /// its Init message has been accepted.
    pub fn set_relay_connection(&self, id: &RelayId, role: RelayRole, conn: ConnectionId) -> Result<()> {
        let mut relays = self.relays.write();
        let relay = relays.get_mut(id).ok_or(RegistryError::RelayNotFound(*id))?;
        match role {
            RelayRole::Caller => relay.caller_conn = Some(conn),
            RelayRole::Callee => relay.callee_conn = Some(conn),
        }
        Ok(())
    }

    pub fn destroy_relay(&self, id: &RelayId) {
        if let Some(relay) = self.relays.write().get_mut(id) {
            relay.status = RelayStatus::Destroyed;
        }
    }

    pub fn remove_relay(&self, id: &RelayId) {
        self.relays.write().remove(id);
    }

    pub fn relay_count(&self) -> usize {
        self.relays.read().len()
    }

    /// Relays that have sat open longer than `max_age` without completing
    /// their handshake, candidates for the expiry sweep.
    pub fn stale_relays(&self, max_age: std::time::Duration) -> Vec<RelayId> {
        let now = Instant::now();
        self.relays
            .read()
            .values()
            .filter(|r| {
                !matches!(r.status, RelayStatus::Open | RelayStatus::Destroyed)
                    && now.duration_since(r.created_at) > max_age
            })
            .map(|r| r.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let registry = ClientRegistry::new();
        let a = registry.allocate_connection_id();
        let b = registry.allocate_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn check_in_and_removal() {
        let registry = ClientRegistry::new();
        let identity = IdentityId([1; 32]);
        let conn = registry.allocate_connection_id();
        registry.add_connection(conn, "127.0.0.1:1".parse().unwrap(), ConnectionRole::Client);
        assert_eq!(registry.check_in(identity, conn), None);

        assert_eq!(registry.find_checked_in(&identity), Some(conn));
        registry.remove_connection(conn);
        assert_eq!(registry.find_checked_in(&identity), None);
    }

    #[test]
    fn re_check_in_flags_previous_connection() {
        let registry = ClientRegistry::new();
        let identity = IdentityId([3; 32]);
        let first = registry.allocate_connection_id();
        let second = registry.allocate_connection_id();

        assert_eq!(registry.check_in(identity, first), None);
        assert_eq!(registry.check_in(identity, second), Some(first));
        assert_eq!(registry.find_checked_in(&identity), Some(second));
    }

    #[test]
    fn push_requires_registered_outbound_channel() {
        use profile_net::{Envelope, MessageKind};

        let registry = ClientRegistry::new();
        let conn = registry.allocate_connection_id();
        let envelope = Envelope { id: 1, kind: MessageKind::Request, payload: vec![] };
        assert!(matches!(registry.push(conn, envelope.clone()), Err(RegistryError::ConnectionGone)));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_outbound(conn, tx);
        registry.push(conn, envelope).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn relay_membership_round_trips() {
        let registry = ClientRegistry::new();
        let conn = registry.allocate_connection_id();
        let relay_id = RelayId(Uuid::new_v4());
        assert_eq!(registry.relay_membership(&conn), None);
        registry.bind_relay_membership(conn, relay_id, RelayRole::Caller);
        assert_eq!(registry.relay_membership(&conn), Some((relay_id, RelayRole::Caller)));
    }

    #[test]
    fn relay_lifecycle() {
        let registry = ClientRegistry::new();
        let callee = IdentityId([2; 32]);
        let relay = registry.create_relay(IdentityId([1; 32]), callee);

        assert_eq!(registry.get_relay(&relay.id).unwrap().status, RelayStatus::WaitingForCalleeResponse);

        registry
            .set_relay_status(&relay.id, RelayStatus::WaitingForFirstInitMessage)
            .unwrap();
        assert_eq!(
            registry.get_relay(&relay.id).unwrap().status,
            RelayStatus::WaitingForFirstInitMessage
        );

        registry.destroy_relay(&relay.id);
        assert_eq!(registry.get_relay(&relay.id).unwrap().status, RelayStatus::Destroyed);
    }

    #[test]
    fn unknown_relay_is_an_error() {
        let registry = ClientRegistry::new();
        let bogus = RelayId(Uuid::new_v4());
        assert!(matches!(registry.get_relay(&bogus), Err(RegistryError::RelayNotFound(_))));
    }
}
