//! profiled server — three listeners (client, app-service, neighbor) sharing
//! one storage and client registry, plus the background action-queue
//! scheduler and relay expiry sweep.

use crate::action_queue::{ActionQueue, Outcome};
use crate::config::Config;
use crate::protocol::{BatchItem, Request, Response};
use crate::registry::{ClientRegistry, ConnectionId, ConnectionRole};
use crate::relay::{self, RelayTimings};
use crate::storage::Storage;
use crate::validator::{self, SentinelPolicy};
use crate::worker::{encode_profile_payload, FollowerClient, NeighborClient, Worker, WorkerError};
use futures_util::{SinkExt, StreamExt};
use profile_core::types::{
    ActionType, HostedIdentity, IdentityId, Location, MAX_HOSTED_IDENTITIES, NeighborhoodAction,
    WireStatus,
};
use profile_net::{Envelope, EnvelopeCodec, MessageKind};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

pub use crate::error::ServerError;

pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    registry: Arc<ClientRegistry>,
    action_queue: Arc<ActionQueue>,
    relay_timings: RelayTimings,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let registry = Arc::new(ClientRegistry::new());
        let action_queue = Arc::new(ActionQueue::new(
            storage.clone(),
            config.action_concurrency,
            Duration::from_secs(config.action_reservation_secs),
            Duration::from_secs(config.soft_failure_backoff_secs),
        ));
        let relay_timings = RelayTimings {
            callee_response_timeout: Duration::from_secs(config.relay_callee_response_timeout_secs),
            init_timeout: Duration::from_secs(config.relay_init_timeout_secs),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Server {
            config,
            storage,
            registry,
            action_queue,
            relay_timings,
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let client_listener = bind(self.config.client_listen).await?;
        let app_listener = bind(self.config.app_service_listen).await?;
        let neighbor_listener = bind(self.config.neighbor_listen).await?;

        info!(
            client = %self.config.client_listen,
            app_service = %self.config.app_service_listen,
            neighbor = %self.config.neighbor_listen,
            "profiled listening"
        );

        let client_handle = self.clone().spawn_accept_loop(client_listener, ConnectionRole::Client);
        let app_handle = self.clone().spawn_accept_loop(app_listener, ConnectionRole::AppService);
        let neighbor_handle = self.clone().spawn_accept_loop(neighbor_listener, ConnectionRole::Neighbor);
        let scheduler_handle = self.clone().spawn_scheduler();
        let sweep_handle = self.clone().spawn_relay_sweep();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        shutdown_rx.recv().await.ok();
        info!("shutdown signal received, draining");

        client_handle.abort();
        app_handle.abort();
        neighbor_handle.abort();
        scheduler_handle.abort();
        sweep_handle.abort();

        tokio::time::sleep(Duration::from_secs(self.config.shutdown_drain_secs)).await;

        self.storage.flush()?;
        Ok(())
    }

    fn spawn_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        role: ConnectionRole,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, addr, role).await {
                                warn!(%addr, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                }
            }
        })
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        role: ConnectionRole,
    ) -> Result<(), ServerError> {
        let conn_id = self.registry.allocate_connection_id();
        self.registry.add_connection(conn_id, addr, role);
        debug!(%addr, ?role, "connection accepted");

        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Envelope>();
        self.registry.register_outbound(conn_id, push_tx);

        let framed = Framed::new(stream, EnvelopeCodec);
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                pushed = push_rx.recv() => {
                    let Some(envelope) = pushed else { break };
                    if sink.send(envelope).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    let Some(frame) = frame else { break };
                    let envelope = match frame {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(%addr, error = %e, "frame decode error");
                            break;
                        }
                    };

                    if envelope.kind == MessageKind::Response {
                        // An ack for a message we pushed to this connection earlier.
                        if let Ok(Response::Status(status)) = postcard::from_bytes(&envelope.payload) {
                            self.registry.complete_push(envelope.id, status);
                        }
                        continue;
                    }

                    let request: Request = match postcard::from_bytes(&envelope.payload) {
                        Ok(r) => r,
                        Err(_) => {
                            let resp = Envelope::response(
                                envelope.id,
                                postcard::to_allocvec(&Response::Status(WireStatus::ErrorProtocolViolation))
                                    .unwrap_or_default(),
                            );
                            let _ = sink.send(resp).await;
                            continue;
                        }
                    };
                    let response = self.dispatch(role, conn_id, request).await;
                    let payload = postcard::to_allocvec(&response).unwrap_or_default();
                    if sink.send(Envelope::response(envelope.id, payload)).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.registry.remove_connection(conn_id);
        Ok(())
    }

    async fn dispatch(&self, role: ConnectionRole, conn_id: ConnectionId, request: Request) -> Response {
        match request {
            Request::CheckIn { identity_id } => {
                if role != ConnectionRole::Client {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                if let Some(previous) = self.registry.check_in(identity_id, conn_id) {
                    let superseded = postcard::to_allocvec(&Request::SessionSuperseded).unwrap_or_default();
                    let _ = self.registry.push(
                        previous,
                        Envelope { id: 0, kind: MessageKind::Request, payload: superseded },
                    );
                }
                Response::Status(WireStatus::Ok)
            }
            Request::CheckOut { identity_id } => {
                if role != ConnectionRole::Client {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                self.registry.check_out(&identity_id);
                Response::Status(WireStatus::Ok)
            }
            Request::GetProfile { identity_id } => match self.storage.get_hosted_identity(&identity_id) {
                Ok(found) => Response::Profile(found.map(|h| h.signed_profile)),
                Err(_) => Response::Status(WireStatus::ErrorInternal),
            },
            Request::UpdateProfile { signed_profile } => self.handle_update_profile(signed_profile),
            Request::RemoveProfile { identity_id } => self.handle_remove_profile(identity_id),
            Request::SharedProfileUpdate { items } => self.handle_batch_update(items),
            Request::SearchProfiles { name_filter, type_filter, extra_data_filter, near, radius_meters, max_results } => {
                self.handle_search(name_filter, type_filter, extra_data_filter, near, radius_meters, max_results)
            }
            Request::RequestRelay { callee_identity } => {
                if role != ConnectionRole::Client {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                let caller_identity = match self.registry.identity_of(&conn_id) {
                    Some(id) => id,
                    None => return Response::Status(WireStatus::ErrorProtocolViolation),
                };
                self.handle_request_relay(caller_identity, callee_identity)
            }
            Request::CalleeRespond { relay_id, accept } => {
                if role != ConnectionRole::Client {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                match relay::callee_respond(&self.registry, relay_id, accept) {
                    Ok(()) => Response::Status(WireStatus::Ok),
                    Err(_) => Response::Status(WireStatus::ErrorRejected),
                }
            }
            Request::CallerInit { relay_id, token } => {
                if role != ConnectionRole::AppService {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                match relay::caller_init(&self.registry, relay_id, token, conn_id) {
                    Ok(()) => Response::Status(WireStatus::Ok),
                    Err(e) => Response::Status(Self::relay_init_error_status(&e)),
                }
            }
            Request::CalleeInit { relay_id, token } => {
                if role != ConnectionRole::AppService {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                match relay::callee_init(&self.registry, relay_id, token, conn_id) {
                    Ok(()) => Response::Status(WireStatus::Ok),
                    Err(e) => Response::Status(Self::relay_init_error_status(&e)),
                }
            }
            Request::SendRelayMessage { payload } => {
                if role != ConnectionRole::AppService {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                match relay::forward_message(&self.registry, conn_id, payload).await {
                    Ok(status) => Response::Status(status),
                    Err(crate::relay::RelayError::NotBound) => Response::Status(WireStatus::ErrorProtocolViolation),
                    Err(crate::relay::RelayError::WrongState) => Response::Status(WireStatus::ErrorRejected),
                    Err(crate::relay::RelayError::PeerNotConnected) => Response::Status(WireStatus::ErrorNotAvailable),
                    Err(_) => Response::Status(WireStatus::ErrorInternal),
                }
            }
            Request::SubmitCard { signed_card } => {
                if role != ConnectionRole::AppService {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                match validator::validate_signed_card(&signed_card) {
                    Ok(()) => Response::Status(WireStatus::Ok),
                    Err(e) => Response::Status(WireStatus::ErrorInvalidValue { details: format!("{}: {}", e.path, e.reason) }),
                }
            }
            Request::ListProfiles => {
                if role != ConnectionRole::Neighbor {
                    return Response::Status(WireStatus::ErrorBadRole);
                }
                let profiles: Vec<_> = self
                    .storage
                    .iter_hosted_identities()
                    .filter_map(|r| r.ok())
                    .map(|h| h.signed_profile)
                    .collect();
                Response::Profiles(profiles)
            }
            // Server-pushed variants are never sent to us as ordinary requests.
            Request::IncomingCallNotification { .. }
            | Request::ReceiveMessageNotification { .. }
            | Request::SessionSuperseded => Response::Status(WireStatus::ErrorProtocolViolation),
        }
    }

    fn handle_update_profile(&self, signed_profile: profile_core::types::SignedProfile) -> Response {
        let identity_id = signed_profile.identity_id();
        if let Err(e) = validator::validate_signed_profile(&signed_profile, &identity_id, SentinelPolicy::Reject) {
            return Response::Status(WireStatus::ErrorInvalidValue { details: format!("{}: {}", e.path, e.reason) });
        }
        let previous = self.storage.get_hosted_identity(&identity_id).ok().flatten();
        let existed = previous.is_some();
        if !existed && self.storage.hosted_identity_count() >= MAX_HOSTED_IDENTITIES {
            return Response::Status(WireStatus::ErrorBusy);
        }
        let previously_no_propagation = previous.as_ref().map(|p| p.signed_profile.profile.no_propagation).unwrap_or(false);
        if let Err(e) = validator::validate_no_propagation_transition(
            !existed,
            previously_no_propagation,
            signed_profile.profile.no_propagation,
        ) {
            return Response::Status(WireStatus::ErrorInvalidValue { details: format!("{}: {}", e.path, e.reason) });
        }

        let identity = HostedIdentity { identity_id, signed_profile, initialized: true };
        if self.storage.put_hosted_identity(&identity).is_err() {
            return Response::Status(WireStatus::ErrorInternal);
        }

        if identity.signed_profile.profile.no_propagation {
            if !previously_no_propagation {
                // Newly opted out of propagation: followers that already hold a
                // copy must drop it rather than receive further updates.
                for follower in self.storage.iter_followers().filter_map(|r| r.ok()) {
                    self.enqueue_action(follower.server_id, ActionType::RemoveProfile, Some(identity_id), String::new());
                }
            }
        } else {
            let action_type = if existed { ActionType::ChangeProfile } else { ActionType::AddProfile };
            self.propagate_to_followers(action_type, Some(identity_id), &identity.signed_profile);
        }
        Response::Status(WireStatus::Ok)
    }

    /// Validate every item of a batch against each other before applying any
    /// of them, so a single bad item never leaves a partially-applied batch.
    fn handle_batch_update(&self, items: Vec<BatchItem>) -> Response {
        let entries: Vec<crate::validator::BatchEntry<'_>> = items
            .iter()
            .map(|item| match item {
                BatchItem::Update(signed) => crate::validator::BatchEntry::Update {
                    identity_id: signed.identity_id(),
                    signed,
                    previously_hosted: self.storage.has_hosted_identity(&signed.identity_id()).unwrap_or(false),
                },
                BatchItem::Delete(identity_id) => crate::validator::BatchEntry::Delete { identity_id: *identity_id },
            })
            .collect();

        if let Err(e) = validator::validate_batch(&entries, self.storage.hosted_identity_count(), MAX_HOSTED_IDENTITIES) {
            return Response::Status(WireStatus::ErrorInvalidValue { details: format!("{}: {}", e.path, e.reason) });
        }

        for item in items {
            let outcome = match item {
                BatchItem::Update(signed) => self.handle_update_profile(signed),
                BatchItem::Delete(identity_id) => self.handle_remove_profile(identity_id),
            };
            if !matches!(outcome, Response::Status(WireStatus::Ok)) {
                return outcome;
            }
        }
        Response::Status(WireStatus::Ok)
    }

    fn handle_remove_profile(&self, identity_id: IdentityId) -> Response {
        if self.storage.remove_hosted_identity(&identity_id).is_err() {
            return Response::Status(WireStatus::ErrorInternal);
        }
        for follower in self.storage.iter_followers().filter_map(|r| r.ok()) {
            self.enqueue_action(follower.server_id, ActionType::RemoveProfile, Some(identity_id), String::new());
        }
        Response::Status(WireStatus::Ok)
    }

    fn propagate_to_followers(
        &self,
        action_type: ActionType,
        target: Option<IdentityId>,
        signed_profile: &profile_core::types::SignedProfile,
    ) {
        let payload = match encode_profile_payload(signed_profile) {
            Ok(p) => p,
            Err(_) => return,
        };
        for follower in self.storage.iter_followers().filter_map(|r| r.ok()) {
            self.enqueue_action(follower.server_id, action_type, target, payload.clone());
        }
    }

    fn handle_search(
        &self,
        name_filter: Option<String>,
        type_filter: Option<String>,
        extra_data_filter: Option<String>,
        near: Option<Location>,
        radius_meters: Option<f64>,
        max_results: u32,
    ) -> Response {
        let limits = validator::SearchRequestLimits::default();
        if let Err(e) = validator::validate_search_request(
            name_filter.as_deref(),
            type_filter.as_deref(),
            extra_data_filter.as_deref(),
            near.as_ref(),
            radius_meters,
            max_results,
            &limits,
        ) {
            return Response::Status(WireStatus::ErrorInvalidValue { details: format!("{}: {}", e.path, e.reason) });
        }
        let extra_data_regex = match extra_data_filter.as_deref().map(Regex::new) {
            Some(Ok(re)) => Some(re),
            Some(Err(_)) => return Response::Status(WireStatus::ErrorInternal),
            None => None,
        };
        let matches: Vec<_> = self
            .storage
            .iter_hosted_identities()
            .filter_map(|r| r.ok())
            .filter(|h| {
                name_filter.as_ref().map(|n| h.signed_profile.profile.name.contains(n.as_str())).unwrap_or(true)
                    && type_filter.as_ref().map(|t| &h.signed_profile.profile.type_ == t).unwrap_or(true)
                    && extra_data_regex.as_ref().map(|re| re.is_match(&h.signed_profile.profile.extra_data)).unwrap_or(true)
                    && match (near, radius_meters) {
                        (Some(origin), Some(radius)) => {
                            let loc = h.signed_profile.profile.location;
                            !loc.is_none() && origin.distance_meters(&loc) <= radius
                        }
                        _ => true,
                    }
            })
            .take(max_results as usize)
            .map(|h| h.signed_profile)
            .collect();
        Response::Profiles(matches)
    }

    /// Replies with an intermediate `RelayPending` ack only — the relay has
    /// been created and the callee notified, but the caller's token is not
    /// ready yet. It arrives later as a `RelayAccepted` push once the callee
    /// answers, or a `RelayFailed` push if it is rejected or times out.
    fn handle_request_relay(&self, caller_identity: IdentityId, callee_identity: IdentityId) -> Response {
        match relay::request_relay(&self.registry, caller_identity, callee_identity) {
            Ok(relay_id) => Response::RelayPending { relay_id },
            Err(_) => Response::Status(WireStatus::ErrorNotAvailable),
        }
    }

    /// Maps `caller_init`/`callee_init` failures to their wire status: a
    /// relay the callee rejected or that timed out reports `ErrorRejected`,
    /// an unknown relay id reports `ErrorNotFound`, a relay presented out of
    /// its expected phase reports `ErrorNotAvailable`, and a token that
    /// doesn't match the relay reports `ErrorInvalidSignature`.
    fn relay_init_error_status(err: &relay::RelayError) -> WireStatus {
        match err {
            relay::RelayError::Destroyed => WireStatus::ErrorRejected,
            relay::RelayError::Registry(crate::registry::RegistryError::RelayNotFound(_)) => {
                WireStatus::ErrorNotFound
            }
            relay::RelayError::WrongState => WireStatus::ErrorNotAvailable,
            relay::RelayError::TokenMismatch => WireStatus::ErrorInvalidSignature,
            _ => WireStatus::ErrorInternal,
        }
    }

    fn enqueue_action(
        &self,
        server_id: profile_core::types::ServerId,
        action_type: ActionType,
        target_identity_id: Option<IdentityId>,
        additional_data: String,
    ) {
        let id = match self.storage.next_action_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to allocate action id");
                return;
            }
        };
        let action = NeighborhoodAction {
            id,
            server_id,
            action_type,
            target_identity_id,
            execute_after: None,
            timestamp: crate::action_queue::now_millis(),
            additional_data,
        };
        if let Err(e) = self.action_queue.enqueue(action) {
            error!(error = %e, "failed to enqueue neighborhood action");
        }
    }

    fn spawn_scheduler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let margin = Duration::from_secs(self.config.add_neighbor_safety_margin_secs);
        let reservation_ttl = Duration::from_secs(self.config.action_reservation_secs);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.scheduler_tick_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_due_actions(margin, reservation_ttl).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn run_due_actions(&self, margin: Duration, reservation_ttl: Duration) {
        let claimed = match self.action_queue.claim_due() {
            Ok(actions) => actions,
            Err(e) => {
                error!(error = %e, "failed to claim due actions");
                return;
            }
        };
        for action in claimed {
            let worker = Worker::new(self.storage.clone(), margin);
            let deadline = std::time::Instant::now() + reservation_ttl;
            let is_follower_push = matches!(
                action.action_type,
                ActionType::AddProfile | ActionType::ChangeProfile | ActionType::RemoveProfile
            );
            let outcome = if is_follower_push {
                match self.storage.get_follower(&action.server_id).ok().flatten() {
                    Some(follower) => {
                        let client = TcpFollowerClient { follower };
                        match worker.push_to_follower(&action, &client).await {
                            Ok(()) => Outcome::Success,
                            Err(WorkerError::FollowerRejected(status)) => {
                                warn!(?status, server = %action.server_id, "follower rejected replication, removing it");
                                let _ = self.storage.remove_follower(&action.server_id);
                                Outcome::HardFailure
                            }
                            Err(e) => {
                                warn!(error = %e, server = %action.server_id, "follower push failed softly");
                                Outcome::SoftFailure
                            }
                        }
                    }
                    None => Outcome::HardFailure,
                }
            } else {
                match self.storage.get_neighbor(&action.server_id).ok().flatten() {
                    Some(neighbor) => {
                        let client = TcpNeighborClient { neighbor: neighbor.clone() };
                        match worker.execute(&action, &client, deadline).await {
                            Ok(()) => Outcome::Success,
                            Err(e) => {
                                warn!(error = %e, server = %action.server_id, "action execution failed softly");
                                Outcome::SoftFailure
                            }
                        }
                    }
                    None => Outcome::HardFailure,
                }
            };
            let is_successful_removal =
                action.action_type == ActionType::RemoveNeighbor && matches!(outcome, Outcome::Success);
            let is_hard_peer_failure = is_follower_push && matches!(outcome, Outcome::HardFailure);
            if is_successful_removal || is_hard_peer_failure {
                match self.action_queue.cancel_all_for_server(action.server_id, action.id) {
                    Ok(n) if n > 0 => debug!(server = %action.server_id, count = n, "cascaded peer removal to queued actions"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "failed to cascade peer removal"),
                }
            }
            if let Err(e) = self.action_queue.complete(&action, outcome) {
                error!(error = %e, "failed to complete action");
            }
        }
    }

    fn spawn_relay_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let timings = RelayTimings {
            callee_response_timeout: self.relay_timings.callee_response_timeout,
            init_timeout: self.relay_timings.init_timeout,
        };
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let n = relay::sweep_expired(&self.registry, &timings);
                        if n > 0 {
                            debug!(count = n, "swept expired relays");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|_| ServerError::BindFailed(addr))
}

/// Neighbor RPC client backing the Replication Worker's bulk import, talking
/// over the same framed protocol the neighbor listener serves.
struct TcpNeighborClient {
    neighbor: profile_core::types::Neighbor,
}

impl NeighborClient for TcpNeighborClient {
    async fn list_all_profiles(
        &self,
        _server_id: profile_core::types::ServerId,
    ) -> anyhow::Result<Vec<profile_core::types::SignedProfile>> {
        let port = self.neighbor.sr_neighbor_port.unwrap_or(self.neighbor.primary_port);
        let addr = SocketAddr::new(self.neighbor.ip_address, port);
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, EnvelopeCodec);

        let payload = postcard::to_allocvec(&Request::ListProfiles)?;
        framed.send(Envelope::request(1, payload)).await?;

        let envelope = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("neighbor closed connection without responding"))??;
        match postcard::from_bytes(&envelope.payload)? {
            Response::Profiles(profiles) => Ok(profiles),
            Response::Status(status) => anyhow::bail!("neighbor rejected ListProfiles: {:?}", status),
            other => anyhow::bail!("unexpected response to ListProfiles: {:?}", other),
        }
    }
}

/// Follower RPC client backing the Replication Worker's per-action push,
/// talking the same framed protocol in the opposite direction.
struct TcpFollowerClient {
    follower: profile_core::types::Follower,
}

impl FollowerClient for TcpFollowerClient {
    async fn push_items(&self, items: Vec<BatchItem>) -> anyhow::Result<WireStatus> {
        let port = self.follower.0.sr_neighbor_port.unwrap_or(self.follower.0.primary_port);
        let addr = SocketAddr::new(self.follower.0.ip_address, port);
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, EnvelopeCodec);

        let payload = postcard::to_allocvec(&Request::SharedProfileUpdate { items })?;
        framed.send(Envelope::request(1, payload)).await?;

        let envelope = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("follower closed connection without responding"))??;
        match postcard::from_bytes(&envelope.payload)? {
            Response::Status(status) => Ok(status),
            other => anyhow::bail!("unexpected response to SharedProfileUpdate: {:?}", other),
        }
    }
}
