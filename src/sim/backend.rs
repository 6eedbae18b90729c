//! Control backend for the in-process network.
//!
//! Joins with a key or through an interactive login approved on the
//! [`MemNetwork`], and persists the machine profile in the node's state
//! store so a restarted node rejoins without logging in again.

use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

use crate::control::backend::{
    BackendState, ControlBackend, Notify, Prefs, StartOptions, Status, Watcher,
};
use crate::error::BoxError;
use crate::observability::NodeLog;
use crate::sim::network::{Machine, MemNetwork};
use crate::stack::{NetMap, PacketEngine};
use crate::store::StateStore;

/// State store key holding the machine profile.
pub const PROFILE_KEY: &str = "_profile";

const LOGIN_BASE: &str = "https://login.embednet.invalid/a/";
const NOTIFY_CAPACITY: usize = 32;

#[derive(Default)]
struct Inner {
    state: BackendState,
    prefs: Prefs,
    ephemeral: bool,
    auth_url: Option<String>,
    last_error: Option<String>,
    machine: Option<Machine>,
}

pub struct MemBackend {
    me: Weak<MemBackend>,
    network: Arc<MemNetwork>,
    store: Arc<dyn StateStore>,
    engine: Arc<dyn PacketEngine>,
    log: NodeLog,
    inner: Mutex<Inner>,
    notify: broadcast::Sender<Notify>,
}

impl MemBackend {
    pub fn new(
        network: Arc<MemNetwork>,
        store: Arc<dyn StateStore>,
        engine: Arc<dyn PacketEngine>,
        log: NodeLog,
    ) -> Arc<Self> {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            store,
            engine,
            log,
            inner: Mutex::new(Inner::default()),
            notify,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: BackendState) {
        if inner.state == state {
            return;
        }
        tracing::debug!(from = %inner.state, to = %state, "Backend state changed");
        inner.state = state;
        let _ = self.notify.send(Notify::state(state));
    }

    fn load_profile(&self) -> Result<Option<Machine>, BoxError> {
        match self.store.read(PROFILE_KEY)? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    fn new_machine(&self, inner: &Inner) -> Machine {
        let (v4, v6) = self.network.allocate();
        let id: [u8; 8] = std::array::from_fn(|_| fastrand::u8(..));
        Machine {
            id: hex::encode(id),
            hostname: inner.prefs.hostname.clone(),
            v4,
            v6,
            ephemeral: inner.ephemeral,
        }
    }

    fn join(&self, inner: &mut Inner, mut machine: Machine) -> Result<(), BoxError> {
        if !inner.prefs.hostname.is_empty() {
            machine.hostname = inner.prefs.hostname.clone();
        }
        let profile = serde_json::to_vec(&machine)?;
        if let Err(e) = self.store.write(PROFILE_KEY, &profile) {
            self.network.release(machine.v4);
            return Err(e.into());
        }
        self.network.register_machine(machine.clone());
        self.network.forget_pending_logins(&self.me);
        self.engine.set_netmap(NetMap {
            self_addresses: machine.addresses(),
            peers: Vec::new(),
        });
        self.log.info(&format!("joined as {} ({})", machine.hostname, machine.v4));
        inner.machine = Some(machine);
        inner.auth_url = None;
        inner.last_error = None;
        self.set_state(inner, BackendState::Running);
        Ok(())
    }

    /// Finish a pending interactive login.
    pub fn complete_login(&self) -> Result<(), BoxError> {
        let mut inner = self.lock();
        if inner.state != BackendState::NeedsLogin {
            return Err(format!("no login pending (state {})", inner.state).into());
        }
        let machine = self.new_machine(&inner);
        self.join(&mut inner, machine)
    }

    pub fn machine(&self) -> Option<Machine> {
        self.lock().machine.clone()
    }
}

impl ControlBackend for MemBackend {
    fn start(&self, opts: StartOptions) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.prefs = opts.prefs;
            inner.ephemeral = opts.login_flags.ephemeral;
            self.set_state(&mut inner, BackendState::Starting);

            if let Some(machine) = self.load_profile()? {
                return self.join(&mut inner, machine);
            }
            match opts.auth_key {
                Some(key) if self.network.accepts_key(&key) => {
                    let machine = self.new_machine(&inner);
                    self.join(&mut inner, machine)
                }
                Some(_) => {
                    let message = "invalid auth key".to_string();
                    inner.last_error = Some(message.clone());
                    inner.state = BackendState::NeedsLogin;
                    let _ = self.notify.send(Notify {
                        state: Some(BackendState::NeedsLogin),
                        error: Some(message),
                        browse_to_url: None,
                    });
                    Ok(())
                }
                None => {
                    self.set_state(&mut inner, BackendState::NeedsLogin);
                    Ok(())
                }
            }
        })
    }

    fn state(&self) -> BackendState {
        self.lock().state
    }

    fn status(&self) -> Status {
        let inner = self.lock();
        Status {
            backend_state: inner.state,
            auth_url: inner.auth_url.clone(),
            hostname: inner
                .machine
                .as_ref()
                .map(|m| m.hostname.clone())
                .unwrap_or_else(|| inner.prefs.hostname.clone()),
            overlay_ips: inner
                .machine
                .as_ref()
                .map(Machine::addresses)
                .unwrap_or_default(),
        }
    }

    fn prefs(&self) -> Prefs {
        self.lock().prefs.clone()
    }

    fn watch(&self) -> Watcher {
        let inner = self.lock();
        let rx = self.notify.subscribe();
        let initial = Notify {
            state: Some(inner.state),
            error: inner.last_error.clone(),
            browse_to_url: inner.auth_url.clone(),
        };
        Watcher::new(initial, rx)
    }

    fn start_login_interactive(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if !matches!(inner.state, BackendState::NeedsLogin | BackendState::NoState) {
                return Ok(());
            }
            let token: [u8; 6] = std::array::from_fn(|_| fastrand::u8(..));
            let url = format!("{LOGIN_BASE}{}", hex::encode(token));
            self.network.add_pending_login(&url, self.me.clone());
            inner.auth_url = Some(url.clone());
            inner.state = BackendState::NeedsLogin;
            let _ = self.notify.send(Notify {
                state: Some(BackendState::NeedsLogin),
                error: None,
                browse_to_url: Some(url),
            });
            Ok(())
        })
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(machine) = inner.machine.take() {
                self.network.remove_machine(&machine.id);
                self.log.info(&format!("logged out {}", machine.hostname));
            }
            self.network.forget_pending_logins(&self.me);
            self.store.write(PROFILE_KEY, b"")?;
            self.engine.set_netmap(NetMap::default());
            inner.auth_url = None;
            self.set_state(&mut inner, BackendState::NeedsLogin);
            Ok(())
        })
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        self.network.forget_pending_logins(&self.me);
        if inner.ephemeral {
            if let Some(machine) = inner.machine.take() {
                self.network.remove_machine(&machine.id);
            }
        }
        self.set_state(&mut inner, BackendState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::backend::LoginFlags;
    use crate::sim::engine::MemEngine;
    use crate::store::MemStore;

    fn backend(network: &Arc<MemNetwork>, store: Arc<dyn StateStore>) -> Arc<MemBackend> {
        let engine: Arc<dyn PacketEngine> = Arc::new(MemEngine::new(Arc::clone(network)));
        MemBackend::new(Arc::clone(network), store, engine, NodeLog::default())
    }

    fn opts(key: Option<&str>) -> StartOptions {
        StartOptions {
            prefs: Prefs {
                hostname: "sensor".into(),
                ..Prefs::default()
            },
            auth_key: key.map(str::to_string),
            login_flags: LoginFlags::default(),
        }
    }

    #[tokio::test]
    async fn auth_key_joins_and_profile_survives_restart() {
        let network = MemNetwork::new();
        let store: Arc<dyn StateStore> = Arc::new(MemStore::new());

        let first = backend(&network, Arc::clone(&store));
        first.start(opts(Some("key"))).await.unwrap();
        assert_eq!(first.state(), BackendState::Running);
        let ips = first.status().overlay_ips;
        assert_eq!(ips.len(), 2);
        first.shutdown();

        let second = backend(&network, store);
        second.start(opts(None)).await.unwrap();
        assert_eq!(second.state(), BackendState::Running);
        assert_eq!(second.status().overlay_ips, ips);
    }

    #[tokio::test]
    async fn rejected_key_reports_error() {
        let network = MemNetwork::new();
        network.restrict_auth_keys(["good"]);
        let backend = backend(&network, Arc::new(MemStore::new()));
        backend.start(opts(Some("bad"))).await.unwrap();

        let mut watcher = backend.watch();
        let initial = watcher.next().await.unwrap();
        assert_eq!(initial.state, Some(BackendState::NeedsLogin));
        assert_eq!(initial.error.as_deref(), Some("invalid auth key"));
    }

    #[tokio::test]
    async fn interactive_login_is_approved_through_network() {
        let network = MemNetwork::new();
        let backend = backend(&network, Arc::new(MemStore::new()));
        backend.start(opts(None)).await.unwrap();
        backend.start_login_interactive().await.unwrap();

        let url = backend.status().auth_url.unwrap();
        assert!(url.starts_with(LOGIN_BASE));
        network.visit_auth_url(&url).unwrap();

        let status = backend.status();
        assert_eq!(status.backend_state, BackendState::Running);
        assert_eq!(status.auth_url, None);
        assert_eq!(status.hostname, "sensor");
    }

    #[tokio::test]
    async fn new_login_replaces_old_url() {
        let network = MemNetwork::new();
        let backend = backend(&network, Arc::new(MemStore::new()));
        backend.start(opts(None)).await.unwrap();

        backend.start_login_interactive().await.unwrap();
        let stale = backend.status().auth_url.unwrap();
        backend.start_login_interactive().await.unwrap();
        let fresh = backend.status().auth_url.unwrap();
        assert_ne!(stale, fresh);
        assert_eq!(network.pending_logins(), 1);

        let err = network.visit_auth_url(&stale).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        network.visit_auth_url(&fresh).unwrap();
        assert_eq!(backend.state(), BackendState::Running);
        assert_eq!(network.pending_logins(), 0);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_login() {
        let network = MemNetwork::new();
        let backend = backend(&network, Arc::new(MemStore::new()));
        backend.start(opts(None)).await.unwrap();
        backend.start_login_interactive().await.unwrap();
        assert_eq!(network.pending_logins(), 1);

        backend.shutdown();
        assert_eq!(network.pending_logins(), 0);
    }

    #[tokio::test]
    async fn logout_forgets_profile() {
        let network = MemNetwork::new();
        let store: Arc<dyn StateStore> = Arc::new(MemStore::new());
        let backend = backend(&network, Arc::clone(&store));
        backend.start(opts(Some("key"))).await.unwrap();
        assert_eq!(network.machines().len(), 1);

        backend.logout().await.unwrap();
        assert_eq!(backend.state(), BackendState::NeedsLogin);
        assert!(network.machines().is_empty());
        assert_eq!(store.read(PROFILE_KEY).unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn ephemeral_machine_leaves_on_shutdown() {
        let network = MemNetwork::new();
        let backend = backend(&network, Arc::new(MemStore::new()));
        let mut start = opts(Some("key"));
        start.login_flags.ephemeral = true;
        backend.start(start).await.unwrap();
        assert_eq!(network.machines().len(), 1);

        backend.shutdown();
        assert_eq!(backend.state(), BackendState::Stopped);
        assert!(network.machines().is_empty());
    }
}
