//! Cluster-scoped admission: the token service SPI, the client/server
//! providers, and the role state machine.
//!
//! The core never talks to the network itself; it defines the
//! request/response shape and the semantic contract, and a transport
//! implementation is plugged in from outside.

pub mod client;
pub mod server;

use crate::clock::{now_ms, sleep_ms};
use crate::value::ParamValue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Minimum spacing between role transitions. A switch arriving earlier
/// sleeps out the remainder so flapping config cannot thrash connections.
const MIN_TRANSITION_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Ok,
    ShouldWait,
    Blocked,
    NoRuleExists,
    TooManyRequests,
    Fail,
    BadRequest,
}

/// Server verdict for one token request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenResult {
    pub status: TokenStatus,
    pub remaining: i64,
    pub wait_ms: u64,
}

impl TokenResult {
    pub fn new(status: TokenStatus) -> Self {
        Self {
            status,
            remaining: 0,
            wait_ms: 0,
        }
    }

    pub fn ok(remaining: i64) -> Self {
        Self {
            status: TokenStatus::Ok,
            remaining,
            wait_ms: 0,
        }
    }

    pub fn blocked() -> Self {
        Self::new(TokenStatus::Blocked)
    }

    pub fn should_wait(wait_ms: u64) -> Self {
        Self {
            status: TokenStatus::ShouldWait,
            remaining: 0,
            wait_ms,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TokenServiceError {
    #[error("token transport failure: {0}")]
    Transport(String),
    #[error("token service not running")]
    NotRunning,
}

/// Remote (or embedded) token acquisition.
pub trait TokenService: Send + Sync {
    fn request_token(
        &self,
        flow_id: u64,
        count: u32,
        prioritized: bool,
    ) -> Result<TokenResult, TokenServiceError>;

    fn request_param_token(
        &self,
        flow_id: u64,
        count: u32,
        params: &[ParamValue],
    ) -> Result<TokenResult, TokenServiceError>;
}

/// Client-side token service with a connection lifecycle.
pub trait ClusterTokenClient: TokenService {
    fn start(&self) -> Result<(), TokenServiceError>;
    fn stop(&self) -> Result<(), TokenServiceError>;
}

/// Token server embedded in this process, serving itself and peers.
pub trait EmbeddedTokenServer: TokenService {
    fn start(&self) -> Result<(), TokenServiceError>;
    fn stop(&self) -> Result<(), TokenServiceError>;
}

/// How a cluster rule's threshold is interpreted server-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterThresholdType {
    /// `count` is per connected node; the global cap is `count × nodes`.
    #[default]
    AvgLocal,
    /// `count` is the global cap itself.
    Global,
}

fn default_fallback() -> bool {
    true
}

/// Cluster half of a flow or parameter rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFlowConfig {
    pub flow_id: u64,
    #[serde(default)]
    pub threshold_type: ClusterThresholdType,
    /// When the token server is unreachable or failing, evaluate the rule
    /// locally instead of passing it.
    #[serde(default = "default_fallback")]
    pub fallback_to_local_when_fail: bool,
}

impl ClusterFlowConfig {
    pub fn new(flow_id: u64) -> Self {
        Self {
            flow_id,
            threshold_type: ClusterThresholdType::default(),
            fallback_to_local_when_fail: default_fallback(),
        }
    }

    pub fn with_threshold_type(mut self, threshold_type: ClusterThresholdType) -> Self {
        self.threshold_type = threshold_type;
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback_to_local_when_fail = fallback;
        self
    }
}

/// Role of this process in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    #[default]
    Off,
    Client,
    Server,
}

#[derive(Debug)]
struct StateInner {
    state: ClusterState,
    last_modified_ms: Option<u64>,
}

static STATE: OnceLock<Mutex<StateInner>> = OnceLock::new();
static CLIENT: OnceLock<RwLock<Option<Arc<dyn ClusterTokenClient>>>> = OnceLock::new();
static SERVER: OnceLock<RwLock<Option<Arc<dyn EmbeddedTokenServer>>>> = OnceLock::new();

fn state() -> &'static Mutex<StateInner> {
    STATE.get_or_init(|| {
        Mutex::new(StateInner {
            state: ClusterState::Off,
            last_modified_ms: None,
        })
    })
}

fn client_slot() -> &'static RwLock<Option<Arc<dyn ClusterTokenClient>>> {
    CLIENT.get_or_init(|| RwLock::new(None))
}

fn server_slot() -> &'static RwLock<Option<Arc<dyn EmbeddedTokenServer>>> {
    SERVER.get_or_init(|| RwLock::new(None))
}

pub fn register_token_client(client: Arc<dyn ClusterTokenClient>) {
    *client_slot().write() = Some(client);
}

pub fn register_token_server(server: Arc<dyn EmbeddedTokenServer>) {
    *server_slot().write() = Some(server);
}

pub fn token_client() -> Option<Arc<dyn ClusterTokenClient>> {
    client_slot().read().clone()
}

pub fn token_server() -> Option<Arc<dyn EmbeddedTokenServer>> {
    server_slot().read().clone()
}

pub fn cluster_state() -> ClusterState {
    state().lock().state
}

pub fn is_client() -> bool {
    cluster_state() == ClusterState::Client
}

pub fn is_server() -> bool {
    cluster_state() == ClusterState::Server
}

/// The token service rule checkers should consult in the current role.
pub(crate) fn pick_token_service() -> Option<ActiveTokenService> {
    match cluster_state() {
        ClusterState::Client => token_client().map(ActiveTokenService::Client),
        ClusterState::Server => token_server().map(ActiveTokenService::Server),
        ClusterState::Off => None,
    }
}

/// Either provider, behind one dispatch.
pub(crate) enum ActiveTokenService {
    Client(Arc<dyn ClusterTokenClient>),
    Server(Arc<dyn EmbeddedTokenServer>),
}

impl ActiveTokenService {
    pub(crate) fn request_token(
        &self,
        flow_id: u64,
        count: u32,
        prioritized: bool,
    ) -> Result<TokenResult, TokenServiceError> {
        match self {
            Self::Client(client) => client.request_token(flow_id, count, prioritized),
            Self::Server(server) => server.request_token(flow_id, count, prioritized),
        }
    }

    pub(crate) fn request_param_token(
        &self,
        flow_id: u64,
        count: u32,
        params: &[ParamValue],
    ) -> Result<TokenResult, TokenServiceError> {
        match self {
            Self::Client(client) => client.request_param_token(flow_id, count, params),
            Self::Server(server) => server.request_param_token(flow_id, count, params),
        }
    }
}

/// Apply a role transition, honouring the debounce. Returns whether the
/// new role's component started (an absent provider leaves the role set
/// but reports failure, matching the contract that config application is
/// best-effort).
pub fn apply_state(target: ClusterState) -> bool {
    let mut guard = state().lock();
    if guard.state == target {
        return true;
    }
    if let Some(last) = guard.last_modified_ms {
        let since = now_ms().saturating_sub(last);
        if since < MIN_TRANSITION_INTERVAL_MS {
            sleep_ms(MIN_TRANSITION_INTERVAL_MS - since);
        }
    }
    guard.state = target;
    guard.last_modified_ms = Some(now_ms());
    drop(guard);

    match target {
        ClusterState::Off => {
            log::info!("cluster mode switching to off");
            stop_client();
            stop_server();
            true
        }
        ClusterState::Client => {
            stop_server();
            match token_client() {
                Some(client) => match client.start() {
                    Ok(()) => {
                        log::info!("cluster mode switched to token client");
                        true
                    }
                    Err(err) => {
                        log::warn!("failed to start cluster token client: {err}");
                        false
                    }
                },
                None => {
                    log::warn!("cannot switch to client mode: no token client registered");
                    false
                }
            }
        }
        ClusterState::Server => {
            stop_client();
            match token_server() {
                Some(server) => match server.start() {
                    Ok(()) => {
                        log::info!("cluster mode switched to embedded token server");
                        true
                    }
                    Err(err) => {
                        log::warn!("failed to start embedded token server: {err}");
                        false
                    }
                },
                None => {
                    log::warn!("cannot switch to server mode: no token server registered");
                    false
                }
            }
        }
    }
}

fn stop_client() {
    if let Some(client) = token_client() {
        if let Err(err) = client.stop() {
            log::warn!("error stopping cluster token client: {err}");
        }
    }
}

fn stop_server() {
    if let Some(server) = token_server() {
        if let Err(err) = server.stop() {
            log::warn!("error stopping embedded token server: {err}");
        }
    }
}
