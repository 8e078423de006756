//! Drives one engine session at a time: writes the engine configuration,
//! starts the engine, flips the OS proxy and reacts to the engine dying.
//!
//! All transitions run under `operation`, so connect, disconnect, the settle
//! check and crash handling never interleave. `inner` is only held for short
//! state updates; proxy and process calls happen outside it.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        mpsc::{self, Receiver, Sender},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    connection_state::ConnectionState,
    engine_config::{self, ConfigDocument},
    error::ConnectError,
    process_log::{LogLevel, LogSink, LogSource},
    profile::Profile,
    settings::{SettingsChange, SettingsStore},
    supervisor::{EngineHandle, EngineHooks, GRACEFUL_SHUTDOWN_TIMEOUT, Supervisor},
    system::{
        ChildExit,
        proxy::{ProxyEndpoints, SystemProxy},
    },
};

pub const SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a fresh engine must stay alive to count as connected.
    pub settle_delay: Duration,
    pub reconnect_delay: Duration,
    pub stop_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            reconnect_delay: RECONNECT_DELAY,
            stop_timeout: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    SystemProxy { enabled: bool, detail: String },
}

#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub executable: PathBuf,
    pub configuration: PathBuf,
}

/// Collaborators the state machine is built from.
pub struct ConnectionServices {
    pub supervisor: Arc<dyn Supervisor>,
    pub proxy: Arc<dyn SystemProxy>,
    pub sink: Arc<dyn LogSink>,
    pub settings: Arc<Mutex<SettingsStore>>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    profile: Option<Profile>,
    /// Bumped for every new engine and every teardown; callbacks carrying an
    /// older value belong to a finished session.
    generation: u64,
    engine: Option<Box<dyn EngineHandle>>,
    proxy_enabled: bool,
    subscribers: Vec<Sender<ConnectionEvent>>,
    pending_stops: Vec<JoinHandle<()>>,
}

impl Inner {
    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::info!("[state] {} -> {}", self.state, state);
        self.state = state.clone();
        self.emit(ConnectionEvent::StateChanged(state));
    }
}

struct Shared {
    inner: Mutex<Inner>,
    operation: Mutex<()>,
    services: ConnectionServices,
    paths: EnginePaths,
    options: ConnectionOptions,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn operation(&self) -> MutexGuard<'_, ()> {
        self.operation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn app_log(&self, level: LogLevel, message: &str) {
        self.services.sink.add_log(message, level, LogSource::App);
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        services: ConnectionServices,
        paths: EnginePaths,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                operation: Mutex::new(()),
                services,
                paths,
                options,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner().state.clone()
    }

    pub fn current_profile(&self) -> Option<Profile> {
        self.shared.inner().profile.clone()
    }

    pub fn configuration_path(&self) -> &Path {
        &self.shared.paths.configuration
    }

    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (sender, receiver) = mpsc::channel();
        self.shared.inner().subscribers.push(sender);
        receiver
    }

    /// Starts `profile`. Returns without waiting for the engine to settle;
    /// the outcome arrives as a state change. Ignored while connecting.
    pub fn connect(&self, profile: Profile) {
        let _operation = self.shared.operation();
        self.start_session(profile);
    }

    /// Must be called with the operation lock held.
    fn start_session(&self, profile: Profile) {
        if self.shared.inner().state.is_connecting() {
            log::info!("[connect] already connecting, ignoring '{}'", profile.name);
            return;
        }
        if self.shared.inner().engine.is_some() {
            self.teardown();
        }

        let routing = match self.shared.services.settings.lock() {
            Ok(settings) => settings.routing().clone(),
            Err(poisoned) => poisoned.into_inner().routing().clone(),
        };

        let generation = {
            let mut inner = self.shared.inner();
            inner.generation += 1;
            inner.profile = Some(profile.clone());
            inner.set_state(ConnectionState::Connecting);
            inner.generation
        };
        log::info!(
            "━━━ CONNECT '{}' ({}, mode={}) ━━━",
            profile.name,
            profile.endpoint(),
            routing.mode
        );
        self.shared.app_log(
            LogLevel::Info,
            &format!("Connecting to {} ({})", profile.name, profile.endpoint()),
        );

        let document = engine_config::build(&profile, &routing);
        let paths = &self.shared.paths;
        let started = write_configuration(&paths.configuration, &document).and_then(|()| {
            self.shared
                .services
                .supervisor
                .start(&paths.executable, &paths.configuration, self.hooks(generation))
                .map_err(ConnectError::from)
        });

        let engine = match started {
            Ok(engine) => engine,
            Err(error) => {
                let message = error.to_string();
                log::error!("[connect] {message}");
                self.shared.app_log(LogLevel::Error, &message);
                let mut inner = self.shared.inner();
                inner.profile = None;
                inner.set_state(ConnectionState::Error(message));
                return;
            }
        };

        log::info!("[connect] engine pid={} starting", engine.id());
        self.shared.inner().engine = Some(engine);

        let manager = self.clone();
        let endpoints = ProxyEndpoints::from_routing(&routing);
        std::thread::spawn(move || {
            std::thread::sleep(manager.shared.options.settle_delay);
            manager.finish_connecting(generation, &endpoints);
        });
    }

    /// Stops the engine and restores the OS proxy. Never waits for the
    /// engine to exit.
    pub fn disconnect(&self) {
        let _operation = self.shared.operation();
        self.teardown();
    }

    /// Restarts the current session after [`ConnectionOptions::reconnect_delay`].
    /// Returns whether a reconnect was scheduled.
    pub fn reconnect(&self) -> bool {
        let profile = {
            let inner = self.shared.inner();
            if !inner.state.is_connected() {
                log::info!("[connect] reconnect ignored in state {}", inner.state);
                return false;
            }
            inner.profile.clone()
        };
        let Some(profile) = profile else {
            return false;
        };

        log::info!("[connect] reconnecting '{}'", profile.name);
        let generation = {
            let _operation = self.shared.operation();
            self.teardown();
            self.shared.inner().generation
        };

        let manager = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(manager.shared.options.reconnect_delay);
            manager.finish_reconnecting(generation, profile);
        });
        true
    }

    /// Any connect or teardown since the reconnect was scheduled cancels it.
    fn finish_reconnecting(&self, generation: u64, profile: Profile) {
        let _operation = self.shared.operation();
        if self.shared.inner().generation != generation {
            log::info!("[connect] scheduled reconnect of '{}' cancelled", profile.name);
            return;
        }
        self.start_session(profile);
    }

    /// Applies a settings mutation to a live session.
    pub fn settings_changed(&self, change: SettingsChange) -> bool {
        if change.requires_reconnect && self.state().is_connected() {
            self.shared
                .app_log(LogLevel::Info, "Settings changed, reconnecting");
            return self.reconnect();
        }
        false
    }

    /// Disconnects and waits for every engine stopped so far to exit.
    pub fn shutdown(&self) {
        self.disconnect();
        let pending = std::mem::take(&mut self.shared.inner().pending_stops);
        for stop in pending {
            if stop.join().is_err() {
                log::warn!("[terminate] stop thread panicked");
            }
        }
        log::info!("[shutdown] connection manager stopped");
    }

    fn hooks(&self, generation: u64) -> EngineHooks {
        let sink = self.shared.services.sink.clone();
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        EngineHooks {
            on_output: Arc::new(move |line: &str| sink.handle_engine_output(line)),
            on_exit: Box::new(move |exit| {
                if let Some(shared) = shared.upgrade() {
                    ConnectionManager { shared }.engine_exited(generation, exit);
                }
            }),
        }
    }

    fn finish_connecting(&self, generation: u64, endpoints: &ProxyEndpoints) {
        let _operation = self.shared.operation();

        let running = {
            let mut inner = self.shared.inner();
            if inner.generation != generation || !inner.state.is_connecting() {
                log::debug!("[connect] settle check for finished session {generation} skipped");
                return;
            }
            let running = inner
                .engine
                .as_ref()
                .is_some_and(|engine| engine.is_running());
            if running {
                inner.proxy_enabled = true;
                inner.set_state(ConnectionState::Connected);
            } else {
                inner.engine = None;
                inner.profile = None;
                inner.set_state(ConnectionState::Error("connection failed".into()));
            }
            running
        };

        if !running {
            log::error!("[connect] engine exited during startup");
            self.shared.app_log(
                LogLevel::Error,
                "Connection failed: engine exited during startup",
            );
            return;
        }

        self.shared.app_log(LogLevel::Info, "Connected");
        let event = match self.shared.services.proxy.enable(endpoints) {
            Ok(detail) => ConnectionEvent::SystemProxy {
                enabled: true,
                detail,
            },
            Err(error) => {
                log::warn!("[proxy] enable failed, engine still reachable locally: {error}");
                self.shared
                    .app_log(LogLevel::Warning, &format!("System proxy not set: {error}"));
                ConnectionEvent::SystemProxy {
                    enabled: false,
                    detail: error.to_string(),
                }
            }
        };
        self.shared.inner().emit(event);
    }

    fn engine_exited(&self, generation: u64, exit: ChildExit) {
        let _operation = self.shared.operation();

        let proxy_was_enabled = {
            let mut inner = self.shared.inner();
            if inner.generation != generation {
                log::debug!("[monitor] exit of finished session {generation} ignored ({exit})");
                return;
            }
            if !inner.state.is_connected() {
                // The settle check reports engines that die while connecting.
                log::info!("[monitor] engine exited in state {} ({exit})", inner.state);
                return;
            }
            inner.generation += 1;
            inner.engine = None;
            inner.profile = None;
            inner.set_state(ConnectionState::Disconnected);
            std::mem::take(&mut inner.proxy_enabled)
        };

        log::error!("[monitor] engine exited while connected ({exit})");
        self.shared.app_log(
            LogLevel::Error,
            &format!("Engine exited unexpectedly ({exit})"),
        );
        if proxy_was_enabled {
            self.restore_proxy();
        }
    }

    /// Must be called with the operation lock held.
    fn teardown(&self) {
        let (engine, proxy_was_enabled) = {
            let mut inner = self.shared.inner();
            inner.generation += 1;
            inner.profile = None;
            inner.set_state(ConnectionState::Disconnected);
            (inner.engine.take(), std::mem::take(&mut inner.proxy_enabled))
        };

        if let Some(engine) = engine {
            log::info!("[disconnect] stopping engine pid={}", engine.id());
            self.shared.app_log(LogLevel::Info, "Disconnected");
            let stop = engine.stop(self.shared.options.stop_timeout);
            let mut inner = self.shared.inner();
            inner.pending_stops.retain(|pending| !pending.is_finished());
            inner.pending_stops.push(stop);
        }
        if proxy_was_enabled {
            self.restore_proxy();
        }
    }

    fn restore_proxy(&self) {
        let event = match self.shared.services.proxy.disable() {
            Ok(detail) => ConnectionEvent::SystemProxy {
                enabled: false,
                detail,
            },
            Err(error) => {
                log::warn!("[proxy] disable failed: {error}");
                self.shared.app_log(
                    LogLevel::Warning,
                    &format!("System proxy not restored: {error}"),
                );
                ConnectionEvent::SystemProxy {
                    enabled: false,
                    detail: error.to_string(),
                }
            }
        };
        self.shared.inner().emit(event);
    }
}

/// Writes the engine configuration, creating its directory if needed.
pub fn write_configuration(path: &Path, document: &ConfigDocument) -> Result<(), ConnectError> {
    let content = document.to_json()?;
    let write = |path: &Path| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content.as_bytes())
    };
    write(path).map_err(|source| ConnectError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("[connect] wrote engine configuration {}", path.display());
    Ok(())
}
