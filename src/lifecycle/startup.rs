//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve the working directory and the node's log identity
//! - Initialize every collaborator in dependency order
//! - Roll back what was already acquired when a step fails
//!
//! # Design Decisions
//! - Fail fast: the first failing step ends startup
//! - Rollback is an explicit LIFO stack of release actions
//! - A close requested mid-startup is honoured at the next step boundary

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env;
use crate::config::NodeConfig;
use crate::control::api::{self, ApiAccess, ApiState};
use crate::control::backend::{
    BackendState, ControlBackend, LoginFlags, Prefs, StartOptions,
};
use crate::control::client::LocalClient;
use crate::error::{InitStep, StartError};
use crate::gateway::LoopbackGateway;
use crate::http::HttpServer;
use crate::lifecycle::authloop;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::subsystems::{BackendContext, Subsystems};
use crate::net::dialer::Dialer;
use crate::net::dispatch::FlowDispatcher;
use crate::net::memnet;
use crate::net::monitor::LinkMonitor;
use crate::net::registry::ListenerRegistry;
use crate::observability::{LogPolicy, LogShipper, NodeLog};
use crate::stack::{PacketEngine, VirtualStack};
use crate::store::{FileStore, MemStore, StateStore, StoreKind, STATE_FILE};

const DIR_PREFIX: &str = "embednet-";
const LEGACY_DIR_PREFIX: &str = "embedlib-";

/// Release actions for the steps that have succeeded so far.
///
/// Dropping the stack runs the actions newest first; `disarm` keeps the
/// resources instead.
#[derive(Default)]
pub(crate) struct CloseStack {
    actions: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl CloseStack {
    pub(crate) fn push(&mut self, name: &'static str, action: impl FnOnce() + Send + 'static) {
        self.actions.push((name, Box::new(action)));
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|(name, _)| *name).collect()
    }

    pub(crate) fn unwind(&mut self) {
        while let Some((name, action)) = self.actions.pop() {
            tracing::debug!(step = name, "Rolling back");
            action();
        }
    }

    pub(crate) fn disarm(mut self) {
        self.actions.clear();
    }
}

impl Drop for CloseStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::debug!(steps = ?self.names(), "Startup failed, releasing acquired steps");
        }
        self.unwind();
    }
}

/// Everything a started node holds.
pub(crate) struct Running {
    pub(crate) dir: PathBuf,
    pub(crate) log: NodeLog,
    pub(crate) shipper: Arc<dyn LogShipper>,
    pub(crate) link: Arc<LinkMonitor>,
    pub(crate) dialer: Arc<Dialer>,
    pub(crate) engine: Arc<dyn PacketEngine>,
    pub(crate) stack: Arc<dyn VirtualStack>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) backend: Arc<dyn ControlBackend>,
    pub(crate) shutdown: Shutdown,
    pub(crate) local_api: CancellationToken,
    pub(crate) local_client: LocalClient,
    pub(crate) gateway: LoopbackGateway,
    pub(crate) torn_down: AtomicBool,
}

/// Inputs to [`initialize`].
pub(crate) struct StartContext<'a> {
    pub(crate) config: &'a NodeConfig,
    pub(crate) store: Option<Arc<dyn StateStore>>,
    pub(crate) log: &'a NodeLog,
    pub(crate) subsystems: &'a dyn Subsystems,
    pub(crate) registry: &'a Arc<ListenerRegistry>,
    pub(crate) closed: &'a AtomicBool,
}

impl StartContext<'_> {
    fn ensure_open(&self) -> Result<(), StartError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StartError::ClosedDuringStartup)
        } else {
            Ok(())
        }
    }
}

/// Bring up every collaborator in order.
pub(crate) async fn initialize(ctx: StartContext<'_>) -> Result<Running, StartError> {
    let config = ctx.config;
    let log = ctx.log.clone();
    let mut rollback = CloseStack::default();

    // 1. Working directory.
    let prog = program_name();
    let dir = match &config.dir {
        Some(dir) => ensure_dir(dir),
        None => default_dir(&prog),
    }
    .map_err(|e| StartError::at(InitStep::StateDir, e))?;
    ctx.ensure_open()?;

    // 2. Log identity.
    let policy = LogPolicy::load_or_create(&dir).map_err(|e| StartError::at(InitStep::LogPolicy, e))?;
    let log_id = policy.log_id();

    // 3. Spool and shipper.
    let shipper = ctx
        .subsystems
        .log_shipper(&dir, &log_id)
        .map_err(|e| StartError::at(InitStep::LogSpool, e))?;
    log.attach(Arc::clone(&shipper), &log_id);
    {
        let log = log.clone();
        let shipper = Arc::clone(&shipper);
        rollback.push("log shipper", move || {
            log.detach();
            shipper.abort();
        });
    }
    log.info(&format!("starting in {} (log id {log_id})", dir.display()));
    ctx.ensure_open()?;

    // 4. Link monitor.
    let link = ctx
        .subsystems
        .link_monitor(config.timeouts.link_poll())
        .await
        .map_err(|e| StartError::at(InitStep::LinkMonitor, e))?;
    {
        let link = Arc::clone(&link);
        rollback.push("link monitor", move || link.close());
    }
    ctx.ensure_open()?;

    // 5. Dialer and packet engine.
    let dialer = Arc::new(Dialer::new());
    let engine = ctx
        .subsystems
        .engine(&dialer, &link)
        .map_err(|e| StartError::at(InitStep::Engine, e))?;
    {
        let dialer = Arc::clone(&dialer);
        let engine = Arc::clone(&engine);
        rollback.push("packet engine", move || {
            engine.close();
            dialer.close();
        });
    }
    ctx.ensure_open()?;

    // 6. Virtual stack with the dispatcher installed.
    let stack = ctx
        .subsystems
        .stack(&engine)
        .map_err(|e| StartError::at(InitStep::VirtualStack, e))?;
    stack.set_interceptor(Arc::new(FlowDispatcher::new(
        Arc::clone(ctx.registry),
        config.listeners.handoff_grace(),
    )));
    dialer.route_overlay(Arc::clone(&engine), Arc::clone(&stack));
    {
        let stack = Arc::clone(&stack);
        rollback.push("virtual stack", move || stack.close());
    }
    ctx.ensure_open()?;

    // 7. State store.
    let store = open_store(config, ctx.store.clone(), &dir)?;
    if store.kind() == StoreKind::Memory && !config.ephemeral {
        return Err(StartError::at(
            InitStep::StateStore,
            "in-memory state store requires an ephemeral node",
        ));
    }

    // 8. Control backend, then start the stack against it.
    let backend = ctx
        .subsystems
        .backend(BackendContext {
            store: &store,
            dialer: &dialer,
            engine: &engine,
            log: &log,
        })
        .map_err(|e| StartError::at(InitStep::Backend, e))?;
    {
        let backend = Arc::clone(&backend);
        rollback.push("control backend", move || backend.shutdown());
    }
    stack
        .start(Arc::clone(&backend))
        .map_err(|e| StartError::at(InitStep::Backend, e))?;
    ctx.ensure_open()?;

    // 9. Preferences and backend start.
    let auth_key = env::resolve_auth_key(config);
    let hostname = config.hostname.clone().unwrap_or_else(|| prog.clone());
    let opts = StartOptions {
        prefs: Prefs {
            hostname,
            want_running: true,
            control_url: config.control_url.clone(),
        },
        auth_key: auth_key.clone(),
        login_flags: LoginFlags {
            ephemeral: config.ephemeral,
        },
    };
    backend
        .start(opts)
        .await
        .map_err(|e| StartError::at(InitStep::BackendStart, e))?;

    let state = backend.state();
    if state == BackendState::NeedsLogin || env::force_login() {
        backend
            .start_login_interactive()
            .await
            .map_err(|e| StartError::at(InitStep::BackendStart, e))?;
    } else if auth_key.is_some() {
        log.info(&format!(
            "auth key is set, but state is {state}; ignoring it (set {} to force login)",
            env::FORCE_LOGIN_VAR
        ));
    }
    ctx.ensure_open()?;

    // 10. Auth URL loop.
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        rollback.push("auth loop", move || shutdown.trigger());
    }
    if matches!(backend.state(), BackendState::NeedsLogin | BackendState::NoState) {
        tokio::spawn(authloop::run(
            Arc::clone(&backend),
            log.clone(),
            config.timeouts.auth_poll(),
            shutdown.token(),
        ));
    }

    // 11. In-memory control API.
    let api_state = ApiState {
        backend: Arc::clone(&backend),
        registry: Arc::clone(ctx.registry),
        stopped: shutdown.token(),
    };
    let (api_listener, api_dialer) = memnet::pipe();
    let local_api = CancellationToken::new();
    tokio::spawn(
        HttpServer::new(api::router(api_state.clone(), ApiAccess::local()))
            .run(api_listener, local_api.clone()),
    );
    {
        let local_api = local_api.clone();
        rollback.push("local API", move || local_api.cancel());
    }
    let local_client = LocalClient::new(api_dialer);
    let gateway = LoopbackGateway::new(Arc::clone(&dialer), api_state, config.timeouts.sniff());
    ctx.ensure_open()?;

    rollback.disarm();
    log.info(&format!("started, backend state {}", backend.state()));
    Ok(Running {
        dir,
        log,
        shipper,
        link,
        dialer,
        engine,
        stack,
        store,
        backend,
        shutdown,
        local_api,
        local_client,
        gateway,
        torn_down: AtomicBool::new(false),
    })
}

fn open_store(
    config: &NodeConfig,
    provided: Option<Arc<dyn StateStore>>,
    dir: &Path,
) -> Result<Arc<dyn StateStore>, StartError> {
    if let Some(store) = provided {
        return Ok(store);
    }
    match config.store.kind {
        StoreKind::Memory => Ok(Arc::new(MemStore::new())),
        StoreKind::File => {
            let path = config
                .store
                .path
                .clone()
                .unwrap_or_else(|| dir.join(STATE_FILE));
            let store = FileStore::open(path).map_err(|e| StartError::at(InitStep::StateStore, e))?;
            Ok(Arc::new(store))
        }
    }
}

/// Lower-cased stem of the running executable.
pub(crate) fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().to_lowercase()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "embednet".to_string())
}

fn default_dir(prog: &str) -> io::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no user config directory"))?;
    resolve_default_dir(base.config_dir(), prog)
}

/// `<config_dir>/embednet-<prog>`, migrating a legacy directory if present.
pub(crate) fn resolve_default_dir(config_dir: &Path, prog: &str) -> io::Result<PathBuf> {
    let dir = config_dir.join(format!("{DIR_PREFIX}{prog}"));
    let legacy = config_dir.join(format!("{LEGACY_DIR_PREFIX}{prog}"));

    match fs::symlink_metadata(&legacy) {
        Ok(meta) if !meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", legacy.display()),
            ));
        }
        Ok(_) if !dir.exists() => {
            fs::rename(&legacy, &dir)?;
            tracing::info!(from = %legacy.display(), to = %dir.display(), "Migrated state directory");
        }
        Ok(_) => {
            tracing::debug!(legacy = %legacy.display(), "Ignoring legacy state directory");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    ensure_dir(&dir)
}

fn ensure_dir(dir: &Path) -> io::Result<PathBuf> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    if !fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is not a directory", dir.display()),
        ));
    }
    Ok(dir.to_path_buf())
}
