//! Commandable component: the standard state machine on top of a
//! [`Controller`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use telebus_core::{
    validate_handlers, Ack, CommandRequest, Controller, Domain, Error, Fields, MetadataSource,
    Result, SessionConfig, WriteTopic,
};

use crate::log_bridge::LogBridge;
use crate::state::{State, Transition};

/// Default interval between heartbeat events.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between acknowledging `exitControl` and stopping.
const EXIT_DELAY: Duration = Duration::from_millis(100);

const SET_SIMULATION_MODE: &str = "setSimulationMode";
const SET_LOG_LEVEL: &str = "setLogLevel";

/// Component-specific behavior of a [`BaseCsc`].
///
/// Every method has a default, so a component overrides only what it needs.
#[async_trait]
pub trait CscHooks: Send + Sync + 'static {
    /// Runs before the state changes; an error leaves the state unchanged.
    async fn begin_transition(
        &self,
        _csc: &CscHandle,
        _transition: Transition,
        _request: &CommandRequest,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs after the state changed; an error restores the previous state.
    async fn end_transition(
        &self,
        _csc: &CscHandle,
        _transition: Transition,
        _request: &CommandRequest,
    ) -> Result<()> {
        Ok(())
    }

    /// Enter or leave simulation mode. The default supports only mode 0.
    async fn implement_simulation_mode(&self, _csc: &CscHandle, mode: i32) -> Result<()> {
        if mode != 0 {
            return Err(Error::expected(format!(
                "This component does not support simulation; simulation_mode={mode} but must be 0"
            )));
        }
        Ok(())
    }

    /// Names of the component-specific commands handled by `do_command`.
    fn command_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle a component-specific command.
    async fn do_command(&self, _csc: &CscHandle, request: CommandRequest) -> Result<Option<Ack>> {
        Err(Error::Protocol(format!(
            "no handler for command {}",
            request.command_name()
        )))
    }

    /// Whether invocations of `command` may run concurrently.
    fn allow_multiple_callbacks(&self, _command: &str) -> bool {
        false
    }
}

/// Startup options of a [`BaseCsc`].
#[derive(Clone)]
pub struct CscOptions {
    pub initial_state: State,
    pub initial_simulation_mode: i32,
    pub heartbeat_interval: Duration,
    pub log_bridge: Option<Arc<LogBridge>>,
}

impl Default for CscOptions {
    fn default() -> Self {
        Self {
            initial_state: State::Standby,
            initial_simulation_mode: 0,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            log_bridge: None,
        }
    }
}

impl CscOptions {
    pub fn with_initial_state(mut self, state: State) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_simulation_mode(mut self, mode: i32) -> Self {
        self.initial_simulation_mode = mode;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_log_bridge(mut self, bridge: Arc<LogBridge>) -> Self {
        self.log_bridge = Some(bridge);
        self
    }
}

/// How the component stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stopped {
    Running,
    Done,
    Failed(String),
}

struct CscInner {
    controller: Controller,
    state: Mutex<State>,
    simulation_mode: AtomicI32,
    heartbeat_interval: Duration,
    log_bridge: Option<Arc<LogBridge>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    stopped: watch::Sender<Stopped>,
}

/// Shared handle to a running component, passed to the hooks.
#[derive(Clone)]
pub struct CscHandle {
    inner: Arc<CscInner>,
}

impl CscHandle {
    pub fn controller(&self) -> &Controller {
        &self.inner.controller
    }

    /// Event writer of the component.
    pub fn evt(&self, name: &str) -> Result<&WriteTopic> {
        self.inner.controller.evt(name)
    }

    /// Telemetry writer of the component.
    pub fn tel(&self, name: &str) -> Result<&WriteTopic> {
        self.inner.controller.tel(name)
    }

    pub fn summary_state(&self) -> State {
        *self.inner.state.lock()
    }

    /// Set the state and report it.
    pub fn set_summary_state(&self, state: State) {
        *self.inner.state.lock() = state;
        self.report_summary_state();
    }

    /// Publish the current state on `summaryState`, even if unchanged.
    pub fn report_summary_state(&self) {
        let state = self.summary_state();
        let fields = single_field("summaryState", json!(state.as_i32()));
        if let Err(e) = self
            .evt("summaryState")
            .and_then(|evt| evt.set_put(fields, true))
        {
            tracing::warn!(error = %e, "Could not report summary state");
        }
    }

    pub fn simulation_mode(&self) -> i32 {
        self.inner.simulation_mode.load(Ordering::SeqCst)
    }

    /// Fail with an expected error unless the component is enabled.
    pub fn assert_enabled(&self, action: &str) -> Result<()> {
        let state = self.summary_state();
        if state != State::Enabled {
            return Err(Error::expected(format!(
                "{action} not allowed in state {state}"
            )));
        }
        Ok(())
    }

    /// Enter the fault state, reporting `code` on `errorCode` if given.
    pub fn fault(&self, code: Option<i32>, report: &str) -> Result<()> {
        let state = self.summary_state();
        if state == State::Offline {
            return Err(Error::expected("cannot enter Fault from Offline"));
        }
        if let Some(code) = code {
            let mut fields = Fields::new();
            fields.insert("errorCode".into(), json!(code));
            fields.insert("errorReport".into(), json!(report));
            fields.insert("traceback".into(), json!(""));
            if let Err(e) = self.evt("errorCode").and_then(|evt| evt.set_put(fields, true)) {
                tracing::warn!(error = %e, "Could not report error code");
            }
        }
        tracing::error!(code, "Entering Fault state: {report}");
        self.set_summary_state(State::Fault);
        Ok(())
    }

    /// Wait until the component stops; `Err` if it stopped because it
    /// could not start.
    pub async fn done(&self) -> Result<()> {
        let mut stopped = self.inner.stopped.subscribe();
        let result = stopped
            .wait_for(|s| *s != Stopped::Running)
            .await
            .map(|s| s.clone());
        match result {
            Ok(Stopped::Failed(message)) => Err(Error::Config(message)),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        *self.inner.stopped.borrow() != Stopped::Running
    }

    /// Stop the heartbeat and the log bridge and close the controller.
    pub async fn stop(&self, failure: Option<String>) {
        if self.is_done() {
            return;
        }
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        if let Some(bridge) = &self.inner.log_bridge {
            bridge.stop().await;
        }
        self.inner.controller.close().await;
        let stopped = match failure {
            Some(message) => Stopped::Failed(message),
            None => Stopped::Done,
        };
        self.inner.stopped.send_replace(stopped);
    }

    async fn set_simulation_mode<H: CscHooks>(&self, hooks: &H, mode: i32) -> Result<()> {
        hooks.implement_simulation_mode(self, mode).await?;
        self.inner.simulation_mode.store(mode, Ordering::SeqCst);
        if self.inner.controller.has_evt("simulationMode") {
            self.evt("simulationMode")?
                .set_put(single_field("mode", json!(mode)), true)?;
        }
        Ok(())
    }

    async fn do_transition<H: CscHooks>(
        &self,
        hooks: &H,
        transition: Transition,
        request: &CommandRequest,
    ) -> Result<Option<Ack>> {
        let current = self.summary_state();
        if !transition.is_allowed_from(current) {
            return Err(Error::expected(format!(
                "{transition} not allowed in state {current}"
            )));
        }
        if let Err(e) = hooks.begin_transition(self, transition, request).await {
            tracing::error!(error = %e, "begin_{transition} failed; remaining in state {current}");
            return Err(e);
        }
        *self.inner.state.lock() = transition.target();
        if let Err(e) = hooks.end_transition(self, transition, request).await {
            *self.inner.state.lock() = current;
            tracing::error!(error = %e, "end_{transition} failed; reverting to state {current}");
            return Err(e);
        }
        self.report_summary_state();

        if transition == Transition::ExitControl {
            let csc = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(EXIT_DELAY).await;
                csc.stop(None).await;
            });
        }
        Ok(None)
    }

    async fn do_set_simulation_mode<H: CscHooks>(
        &self,
        hooks: &H,
        request: &CommandRequest,
    ) -> Result<Option<Ack>> {
        let state = self.summary_state();
        if !matches!(state, State::Standby | State::Disabled) {
            return Err(Error::expected(format!(
                "Cannot set simulation_mode in state {state}"
            )));
        }
        let mode: i32 = request.field("mode")?;
        self.set_simulation_mode(hooks, mode).await?;
        Ok(None)
    }

    fn do_set_log_level(&self, request: &CommandRequest) -> Result<Option<Ack>> {
        let level: i32 = request.field("level")?;
        let subsystem: String = request.field("subsystem").unwrap_or_default();
        if let Some(bridge) = &self.inner.log_bridge {
            bridge.set_level(level);
        }
        let mut fields = Fields::new();
        fields.insert("level".into(), json!(level));
        fields.insert("subsystem".into(), json!(subsystem));
        self.evt("logLevel")?.set_put(fields, true)?;
        Ok(None)
    }

    async fn heartbeat_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.evt("heartbeat").and_then(|evt| evt.put(None)) {
                tracing::debug!(error = %e, "Heartbeat stopped");
                break;
            }
        }
    }
}

fn single_field(name: &str, value: serde_json::Value) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), value);
    fields
}

/// Commandable component.
///
/// Handles the standard state transitions, `setSimulationMode` and
/// `setLogLevel`; everything else goes to the hooks.
pub struct BaseCsc<H: CscHooks> {
    handle: CscHandle,
    hooks: Arc<H>,
    initial_simulation_mode: i32,
}

impl<H: CscHooks> BaseCsc<H> {
    /// Create the component's controller and check that the hooks handle
    /// exactly the component-specific commands.
    pub fn new(
        domain: &Domain,
        name: &str,
        index: u32,
        metadata: &dyn MetadataSource,
        config: SessionConfig,
        hooks: H,
        options: CscOptions,
    ) -> Result<Self> {
        if options.heartbeat_interval.is_zero() {
            return Err(Error::InvalidValue(
                "heartbeat interval must be positive".into(),
            ));
        }
        let controller = Controller::new(domain, name, index, metadata, config)?;
        let commands = controller.command_names();

        let standard: BTreeSet<String> = standard_command_names()
            .filter(|name| commands.contains(name))
            .collect();
        let custom: BTreeSet<String> = hooks.command_names().into_iter().collect();
        if let Some(name) = custom.intersection(&standard).next() {
            return Err(Error::Protocol(format!(
                "{name} is a standard command and cannot be handled by the component"
            )));
        }
        let handled: BTreeSet<String> = standard.union(&custom).cloned().collect();
        validate_handlers(&commands, &handled)?;

        let (stopped, _) = watch::channel(Stopped::Running);
        let handle = CscHandle {
            inner: Arc::new(CscInner {
                controller,
                state: Mutex::new(options.initial_state),
                simulation_mode: AtomicI32::new(0),
                heartbeat_interval: options.heartbeat_interval,
                log_bridge: options.log_bridge,
                heartbeat: Mutex::new(None),
                stopped,
            }),
        };
        Ok(Self {
            handle,
            hooks: Arc::new(hooks),
            initial_simulation_mode: options.initial_simulation_mode,
        })
    }

    pub fn handle(&self) -> &CscHandle {
        &self.handle
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    pub fn summary_state(&self) -> State {
        self.handle.summary_state()
    }

    /// Install the command handlers, start the controller, apply the
    /// initial simulation mode and report the initial state.
    ///
    /// If the simulation mode is rejected the component stops and
    /// [`CscHandle::done`] reports the failure.
    pub async fn start(&self) -> Result<()> {
        self.install_handlers()?;
        let controller = self.handle.controller();
        controller.start().await?;

        if let Some(bridge) = &self.handle.inner.log_bridge {
            match controller.evt("logMessage") {
                Ok(evt) => bridge.start(evt.clone())?,
                Err(_) => tracing::warn!("Component has no logMessage event; log bridge disabled"),
            }
        }

        if let Err(e) = self
            .handle
            .set_simulation_mode(&*self.hooks, self.initial_simulation_mode)
            .await
        {
            tracing::error!(error = %e, "Could not set initial simulation mode");
            self.handle.stop(Some(e.to_string())).await;
            return Err(e);
        }

        self.handle.report_summary_state();
        let heartbeat = tokio::spawn(self.handle.clone().heartbeat_loop());
        *self.handle.inner.heartbeat.lock() = Some(heartbeat);
        tracing::info!(
            component = %controller.session().name_index(),
            state = %self.summary_state(),
            "Component started"
        );
        Ok(())
    }

    fn install_handlers(&self) -> Result<()> {
        let controller = self.handle.controller();
        let commands = controller.command_names();

        for transition in Transition::ALL {
            let name = transition.command_name();
            if !commands.iter().any(|c| c == name) {
                continue;
            }
            let (csc, hooks) = (self.handle.clone(), Arc::clone(&self.hooks));
            controller.cmd(name)?.set_handler(false, move |request| {
                let (csc, hooks) = (csc.clone(), Arc::clone(&hooks));
                async move { csc.do_transition(&*hooks, transition, &request).await }
            })?;
        }

        if commands.iter().any(|c| c == SET_SIMULATION_MODE) {
            let (csc, hooks) = (self.handle.clone(), Arc::clone(&self.hooks));
            controller.cmd(SET_SIMULATION_MODE)?.set_handler(false, move |request| {
                let (csc, hooks) = (csc.clone(), Arc::clone(&hooks));
                async move { csc.do_set_simulation_mode(&*hooks, &request).await }
            })?;
        }

        if commands.iter().any(|c| c == SET_LOG_LEVEL) {
            let csc = self.handle.clone();
            controller.cmd(SET_LOG_LEVEL)?.set_handler(false, move |request| {
                let csc = csc.clone();
                async move { csc.do_set_log_level(&request) }
            })?;
        }

        for name in self.hooks.command_names() {
            let (csc, hooks) = (self.handle.clone(), Arc::clone(&self.hooks));
            let allow_multiple = self.hooks.allow_multiple_callbacks(&name);
            controller.cmd(&name)?.set_handler(allow_multiple, move |request| {
                let (csc, hooks) = (csc.clone(), Arc::clone(&hooks));
                async move { hooks.do_command(&csc, request).await }
            })?;
        }
        Ok(())
    }

    /// Enter the fault state; see [`CscHandle::fault`].
    pub fn fault(&self, code: Option<i32>, report: &str) -> Result<()> {
        self.handle.fault(code, report)
    }

    /// Wait until `exitControl` or [`BaseCsc::close`] stops the component.
    pub async fn done(&self) -> Result<()> {
        self.handle.done().await
    }

    pub async fn close(&self) {
        self.handle.stop(None).await
    }
}

fn standard_command_names() -> impl Iterator<Item = String> {
    Transition::ALL
        .into_iter()
        .map(|t| t.command_name())
        .chain([SET_SIMULATION_MODE, SET_LOG_LEVEL])
        .map(String::from)
}
