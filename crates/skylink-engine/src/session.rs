/*!
 * Device sessions.
 *
 * A [`Session`] owns one device connection for its whole lifecycle:
 *
 * ```text
 * Disconnected --connect--> Handshaking --ok--> Idle --submit--> Busy
 *      ^                         |                ^               |
 *      |                         +--fail----------|---------------+ completed -> Idle
 *      +------------- disconnect (any state) -----+               + failed    -> Faulted
 * ```
 *
 * Everything that touches the wire or the property store runs under one
 * async mutex, so commands are strictly serialised and the store has a
 * single mutation gate. Notifications are collected while the lock is held
 * and delivered after it is released.
 */
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use skylink_core::config::{DeviceConfig, SessionDefaults, TransportConfig};
use skylink_core::event::SharedEventBus;
use skylink_core::logging::{session_span, Span};
use skylink_core::types::Id;
use skylink_devices::device::{Capability, DeviceIdentity, DeviceInfo, Intent};
use skylink_devices::driver::{Driver, Health};
use skylink_devices::error::{ConnectError, ErrorKind};
use skylink_devices::property::{Property, PropertyChange, PropertyStore};
use skylink_devices::transport::{Connector, Link, SystemConnector};
use skylink_devices::{drivers, sim};

use crate::dispatcher;
use crate::error::{DispatchError, Result, SessionError};
use crate::event::{SessionEvent, SessionEventKind};
use crate::operation::{Operation, OperationHandle, OperationStatus, Tracked, HISTORY_LIMIT};
use crate::poller;

/// Capacity of the per-session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Connection open, identifying the device
    Handshaking,
    /// Connected with no operation in progress
    Idle,
    /// An operation is in progress
    Busy,
    /// An operation failed; needs reset() or a reconnect
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Mutable session state, guarded by the session mutex
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub(crate) id: Id,
    pub(crate) name: String,
    pub(crate) timing: SessionDefaults,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) link: Option<Link>,
    pub(crate) store: PropertyStore,
    pub(crate) state: SessionState,
    pub(crate) info: Option<DeviceInfo>,
    pub(crate) current: Option<Tracked>,
    pub(crate) halting: Option<Tracked>,
    pub(crate) history: VecDeque<Operation>,
    pub(crate) fault: Option<String>,
    pending: Vec<SessionEvent>,
}

impl SessionCore {
    fn new(id: Id, name: String, driver: Box<dyn Driver>, timing: SessionDefaults) -> Self {
        let store = PropertyStore::from_schema(&driver.schema());
        Self {
            id,
            name,
            timing,
            driver,
            link: None,
            store,
            state: SessionState::Disconnected,
            info: None,
            current: None,
            halting: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            fault: None,
            pending: Vec::new(),
        }
    }

    pub(crate) fn notify(&mut self, kind: SessionEventKind) {
        self.pending.push(SessionEvent::new(&self.id, &self.name, kind));
    }

    fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Session {}: {} -> {}", self.name, from, to);
        self.state = to;
        self.notify(SessionEventKind::StateChanged { from, to });
    }

    pub(crate) fn record_changes<I: IntoIterator<Item = PropertyChange>>(&mut self, changes: I) {
        for change in changes {
            self.notify(SessionEventKind::PropertyChanged(change));
        }
    }

    pub(crate) fn publish_operation(&mut self, tracked: &Tracked) {
        self.notify(SessionEventKind::OperationUpdated(tracked.op.clone()));
    }

    /// Move a terminal operation into the history
    pub(crate) fn archive(&mut self, op: Operation) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(op);
    }

    /// Publish a terminal operation and archive it
    pub(crate) fn finish(&mut self, tracked: Tracked) {
        self.publish_operation(&tracked);
        self.archive(tracked.op);
    }

    pub(crate) fn fault(&mut self, reason: String) {
        self.fault = Some(reason);
        self.set_state(SessionState::Faulted);
    }

    /// Whether a new operation may start
    pub(crate) fn ensure_accepting(&self) -> std::result::Result<(), DispatchError> {
        match self.state {
            SessionState::Disconnected | SessionState::Handshaking => Err(DispatchError::NotConnected),
            SessionState::Faulted => Err(DispatchError::Faulted(
                self.fault.clone().unwrap_or_else(|| "unknown fault".to_string()),
            )),
            SessionState::Busy => Err(DispatchError::Busy(match &self.current {
                Some(tracked) => format!("{} {} in progress", tracked.op.kind(), tracked.op.id),
                None => "operation in progress".to_string(),
            })),
            SessionState::Idle => match &self.halting {
                Some(tracked) => Err(DispatchError::Busy(format!(
                    "{} {} is still halting",
                    tracked.op.kind(),
                    tracked.op.id
                ))),
                None => Ok(()),
            },
        }
    }

    /// Tear the connection down, failing whatever was in flight
    async fn shutdown(&mut self) {
        if let Some(mut tracked) = self.current.take() {
            tracked.fail(
                ErrorKind::ResourceUnavailable,
                "session disconnected".to_string(),
            );
            self.finish(tracked);
        }
        if let Some(tracked) = self.halting.take() {
            self.archive(tracked.op);
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                debug!("Closing {} failed: {}", link.describe(), e);
            }
        }
        let stale = self.store.mark_stale();
        self.record_changes(stale);
        self.info = None;
        self.fault = None;
        self.set_state(SessionState::Disconnected);
    }
}

type Callback = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, Callback)>>,
}

impl Subscribers {
    fn add(&mut self, key: String, callback: Callback) -> u64 {
        self.next_id += 1;
        self.by_key.entry(key).or_default().push((self.next_id, callback));
        self.next_id
    }

    fn remove(&mut self, key: &str, id: u64) {
        if let Some(list) = self.by_key.get_mut(key) {
            list.retain(|(i, _)| *i != id);
            if list.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    fn callbacks(&self, key: &str) -> Vec<Callback> {
        self.by_key
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    id: Id,
    identity: DeviceIdentity,
    capabilities: Vec<Capability>,
    timing: SessionDefaults,
    connector: Arc<dyn Connector>,
    core: Mutex<SessionCore>,
    events: broadcast::Sender<SessionEvent>,
    bus: StdMutex<Option<SharedEventBus>>,
    subscribers: StdMutex<Subscribers>,
    poller: StdMutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let poller = self.poller.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }
}

/// One device connection with its state machine, dispatcher and poller
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("device", &self.shared.identity.name)
            .field("address", &self.shared.identity.address)
            .finish()
    }
}

/// Non-owning session reference held by the background poller
pub(crate) struct WeakSession(Weak<Shared>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|shared| Session { shared })
    }
}

/// Keeps a property callback registered; dropping it unsubscribes
#[must_use = "the callback is removed when the subscription is dropped"]
pub struct Subscription {
    shared: Weak<Shared>,
    key: String,
    id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.subscribers).remove(&self.key, self.id);
        }
    }
}

impl Session {
    /// Create a disconnected session
    pub fn new(
        identity: DeviceIdentity,
        driver: Box<dyn Driver>,
        connector: Arc<dyn Connector>,
        timing: SessionDefaults,
    ) -> Self {
        let id = Id::new();
        let span = session_span(&identity.name, driver.name());
        let capabilities = driver.capabilities().to_vec();
        let core = SessionCore::new(id.clone(), identity.name.clone(), driver, timing.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                id,
                identity,
                capabilities,
                timing,
                connector,
                core: Mutex::new(core),
                events,
                bus: StdMutex::new(None),
                subscribers: StdMutex::new(Subscribers::default()),
                poller: StdMutex::new(None),
                span,
            }),
        }
    }

    /// Create a session for a configured device.
    ///
    /// Simulated transports get the simulator for their model; everything
    /// else goes through the system connector.
    pub fn from_config(config: &DeviceConfig, defaults: &SessionDefaults) -> Result<Self> {
        let driver = drivers::build(config)?;
        let connector: Arc<dyn Connector> = match &config.transport {
            TransportConfig::Simulated { model } => Arc::new(sim::connector_for(model)?),
            _ => Arc::new(SystemConnector::new()),
        };
        let identity = DeviceIdentity::from_config(config, driver.kind(), driver.model());
        Ok(Self::new(
            identity,
            driver,
            connector,
            config.effective_session(defaults),
        ))
    }

    /// Also publish this session's events on a shared bus
    pub fn attach_event_bus(&self, bus: SharedEventBus) {
        *lock(&self.shared.bus) = Some(bus);
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.shared))
    }

    /// Session ID
    pub fn id(&self) -> &Id {
        &self.shared.id
    }

    /// Configured device name
    pub fn name(&self) -> &str {
        &self.shared.identity.name
    }

    /// Device identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    /// Effective timing
    pub fn timing(&self) -> &SessionDefaults {
        &self.shared.timing
    }

    /// Capabilities the driver declares
    pub fn capabilities(&self) -> &[Capability] {
        &self.shared.capabilities
    }

    /// Whether the driver declares a capability
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.shared.capabilities.contains(&capability)
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.shared.core.lock().await.state
    }

    /// Why the session is faulted, if it is
    pub async fn fault_reason(&self) -> Option<String> {
        self.shared.core.lock().await.fault.clone()
    }

    /// What the device reported during the handshake
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.core.lock().await.info.clone()
    }

    /// Open the transport, identify the device and take a first poll
    pub async fn connect(&self) -> Result<()> {
        let span = self.shared.span.clone();
        async {
            let (result, events) = {
                let mut core = self.shared.core.lock().await;
                let result = self.connect_locked(&mut core).await;
                (result, core.take_events())
            };
            self.emit(events);
            result?;

            if self.shared.timing.autopoll {
                self.start_poller();
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn connect_locked(&self, core: &mut SessionCore) -> Result<()> {
        if core.state != SessionState::Disconnected {
            return Err(SessionError::AlreadyConnected(core.state));
        }
        core.set_state(SessionState::Handshaking);

        let identity = &self.shared.identity;
        let timeout = self.shared.timing.command_timeout();
        let transport = match self.shared.connector.open(&identity.address, timeout).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Opening {} failed: {}", identity.address, e);
                core.set_state(SessionState::Disconnected);
                return Err(e.into());
            }
        };

        let mut link = Link::new(transport, timeout);
        let info = match core.driver.handshake(&mut link).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Handshake with {} failed: {}", identity.address, e);
                if let Err(close) = link.close().await {
                    debug!("Closing after failed handshake: {}", close);
                }
                core.set_state(SessionState::Disconnected);
                return Err(ConnectError::HandshakeFailed(e.to_string()).into());
            }
        };

        info!(
            "Connected to {} {} at {} (firmware {:?})",
            identity.kind, identity.model, identity.address, info.firmware
        );
        core.store = PropertyStore::from_schema(&core.driver.schema());
        core.link = Some(link);
        core.info = Some(info);
        core.fault = None;
        core.set_state(SessionState::Idle);

        if let Err(e) = poller::poll_once(core).await {
            warn!("Initial poll of {} failed: {}", identity.name, e);
        }
        Ok(())
    }

    /// Close the connection from any state.
    ///
    /// An operation still in progress fails with `ResourceUnavailable`.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_poller().await;
        let events = {
            let mut core = self.shared.core.lock().await;
            if core.state != SessionState::Disconnected {
                core.shutdown().await;
            }
            core.take_events()
        };
        self.emit(events);
        Ok(())
    }

    /// Start an operation with the configured deadline
    pub async fn submit(&self, intent: Intent) -> std::result::Result<OperationHandle, DispatchError> {
        self.submit_with_deadline(intent, self.shared.timing.operation_timeout())
            .await
    }

    /// Start an operation that must finish (or keep progressing) within `timeout`
    pub async fn submit_with_deadline(
        &self,
        intent: Intent,
        timeout: Duration,
    ) -> std::result::Result<OperationHandle, DispatchError> {
        let span = self.shared.span.clone();
        async {
            let (result, events) = {
                let mut core = self.shared.core.lock().await;
                let result = dispatcher::submit(&mut core, intent, timeout).await;
                (result, core.take_events())
            };
            self.emit(events);
            result
        }
        .instrument(span)
        .await
    }

    /// Halt the operation in progress. Succeeds when there is none.
    pub async fn abort(&self) -> std::result::Result<(), DispatchError> {
        let span = self.shared.span.clone();
        async {
            let (result, events) = {
                let mut core = self.shared.core.lock().await;
                let result = dispatcher::abort(&mut core).await;
                (result, core.take_events())
            };
            self.emit(events);
            result
        }
        .instrument(span)
        .await
    }

    /// Run one poll cycle now
    pub async fn poll_now(&self) -> std::result::Result<(), DispatchError> {
        let span = self.shared.span.clone();
        async {
            let (result, events) = {
                let mut core = self.shared.core.lock().await;
                let result = poller::poll_once(&mut core).await;
                (result, core.take_events())
            };
            self.emit(events);
            result
        }
        .instrument(span)
        .await
    }

    /// Leave the Faulted state if the device reports itself recovered
    pub async fn reset(&self) -> Result<()> {
        let span = self.shared.span.clone();
        async {
            let (result, events) = {
                let mut core = self.shared.core.lock().await;
                let result = Self::reset_locked(&mut core).await;
                (result, core.take_events())
            };
            self.emit(events);
            result
        }
        .instrument(span)
        .await
    }

    async fn reset_locked(core: &mut SessionCore) -> Result<()> {
        if core.state != SessionState::Faulted {
            return Err(SessionError::NotFaulted(core.state));
        }
        poller::poll_once(core)
            .await
            .map_err(|e| SessionError::StillFaulted(e.to_string()))?;

        match core.driver.health(&core.store) {
            Health::Ok => {
                info!("Device {} reports recovered", core.name);
                core.fault = None;
                core.set_state(SessionState::Idle);
                Ok(())
            }
            Health::Fault(reason) => Err(SessionError::StillFaulted(reason)),
        }
    }

    /// A property's last confirmed state, `None` for keys the driver does not have
    pub async fn get_property(&self, key: &str) -> Option<Property> {
        self.shared.core.lock().await.store.get(key).cloned()
    }

    /// Every property, ordered by key
    pub async fn snapshot(&self) -> BTreeMap<String, Property> {
        self.shared.core.lock().await.store.snapshot()
    }

    /// The operation in progress, if any
    pub async fn current_operation(&self) -> Option<Operation> {
        let core = self.shared.core.lock().await;
        core.current.as_ref().map(|tracked| tracked.op.clone())
    }

    /// Finished operations, oldest first
    pub async fn history(&self) -> Vec<Operation> {
        self.shared.core.lock().await.history.iter().cloned().collect()
    }

    /// Call `callback` whenever the poller or dispatcher changes `key`
    pub fn subscribe<K, F>(&self, key: K, callback: F) -> Subscription
    where
        K: Into<String>,
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        let key = key.into();
        let id = lock(&self.shared.subscribers).add(key.clone(), Arc::new(callback));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            key,
            id,
        }
    }

    /// Receive every event this session publishes from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        let bus = lock(&self.shared.bus).clone();

        for event in events {
            if let SessionEventKind::PropertyChanged(change) = &event.kind {
                let callbacks = lock(&self.shared.subscribers).callbacks(&change.key);
                for callback in callbacks {
                    callback(change);
                }
            }
            if let SessionEventKind::OperationUpdated(op) = &event.kind {
                if op.status == OperationStatus::InProgress {
                    debug!("Operation {} {} in progress", op.kind(), op.id);
                }
            }
            if let Some(bus) = &bus {
                if let Err(e) = bus.publish(event.clone()) {
                    warn!("Failed to publish session event: {}", e);
                }
            }
            // Nobody listening is fine
            let _ = self.shared.events.send(event);
        }
    }

    fn start_poller(&self) {
        let handle = poller::spawn(self.downgrade(), self.shared.timing.poll_interval());
        if let Some(previous) = lock(&self.shared.poller).replace(handle) {
            previous.abort();
        }
    }

    async fn stop_poller(&self) {
        let handle = lock(&self.shared.poller).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as SimMutex;

    use skylink_core::types::Value;
    use skylink_devices::error::{CodecError, DriverError, TransportError};
    use skylink_devices::property::Validity;
    use skylink_devices::sim::{DomeSim, FrameFocuserSim, SimConnector, SimDevice, TelescopeSim};

    fn timing() -> SessionDefaults {
        SessionDefaults {
            poll_interval_ms: 1000,
            command_timeout_ms: 500,
            operation_timeout_ms: 60_000,
            halt_grace_ms: 1000,
            autopoll: false,
        }
    }

    fn session_with<D: SimDevice + 'static>(
        driver: &str,
        sim: D,
        timing: SessionDefaults,
    ) -> (Session, Arc<SimMutex<D>>, SimConnector) {
        let sim = Arc::new(SimMutex::new(sim));
        let connector = SimConnector::new(Arc::clone(&sim));
        let config = DeviceConfig::new(
            "test",
            driver,
            TransportConfig::Simulated {
                model: driver.to_string(),
            },
        );
        let driver = drivers::build(&config).unwrap();
        let identity = DeviceIdentity::from_config(&config, driver.kind(), driver.model());
        let session = Session::new(identity, driver, Arc::new(connector.clone()), timing);
        (session, sim, connector)
    }

    fn focuser(sim: FrameFocuserSim) -> (Session, Arc<SimMutex<FrameFocuserSim>>, SimConnector) {
        session_with("frame-focuser", sim, timing())
    }

    async fn position(session: &Session) -> Option<Value> {
        session.get_property("position").await.and_then(|p| p.value)
    }

    async fn parked(session: &Session) -> Option<Value> {
        session.get_property("parked").await.and_then(|p| p.value)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_focuser_move_completes() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Idle);
        assert_eq!(position(&session).await, Some(Value::Int(1000)));

        let handle = session
            .submit_with_deadline(Intent::MoveAbsolute(2000), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.state().await, SessionState::Busy);
        assert_eq!(handle.status(), OperationStatus::InProgress);

        // Only the acknowledged target is written; position waits for a poll
        assert_eq!(position(&session).await, Some(Value::Int(1000)));
        let target = session.get_property("target").await.unwrap();
        assert_eq!(target.value, Some(Value::Int(2000)));

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(400)).await;
            session.poll_now().await.unwrap();
        }

        let op = handle.wait().await;
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(position(&session).await, Some(Value::Int(2000)));
        assert_eq!(session.state().await, SessionState::Idle);
        assert_eq!(session.history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_move_times_out_at_deadline() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000).with_step(250).freeze_at(1500));
        session.connect().await.unwrap();
        let handle = session
            .submit_with_deadline(Intent::MoveAbsolute(2000), Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(300)).await;
            session.poll_now().await.unwrap();
        }
        // Stalled at 1500 but the deadline has not passed
        assert_eq!(position(&session).await, Some(Value::Int(1500)));
        assert_eq!(handle.status(), OperationStatus::InProgress);

        tokio::time::advance(Duration::from_millis(300)).await;
        session.poll_now().await.unwrap();

        let op = handle.wait().await;
        assert_eq!(op.status, OperationStatus::Failed(ErrorKind::Timeout));
        assert_eq!(session.state().await, SessionState::Faulted);
        assert!(matches!(
            session.submit(Intent::MoveAbsolute(1000)).await,
            Err(DispatchError::Faulted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hunting_move_times_out_at_deadline() {
        let (session, sim, _) = focuser(FrameFocuserSim::new(1000).with_step(500).hunt(1));
        session.connect().await.unwrap();
        let started = tokio::time::Instant::now();
        let handle = session
            .submit_with_deadline(Intent::MoveAbsolute(2000), Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 0..100 {
            if handle.status().is_terminal() {
                break;
            }
            tokio::time::advance(Duration::from_millis(500)).await;
            session.poll_now().await.unwrap();
        }

        // The position keeps changing but never gets closer than one step
        assert!(sim.lock().unwrap().is_moving());
        assert_eq!(handle.status(), OperationStatus::Failed(ErrorKind::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state().await, SessionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_park_waits_for_mount_report() {
        let (session, _, _) = session_with(
            "alpaca-telescope",
            TelescopeSim::new(2.0, 30.0).with_park_delay(2),
            timing(),
        );
        session.connect().await.unwrap();
        assert_eq!(parked(&session).await, Some(Value::Bool(false)));

        let handle = session.submit(Intent::Park).await.unwrap();
        assert_eq!(parked(&session).await, Some(Value::Bool(false)));

        for _ in 0..2 {
            session.poll_now().await.unwrap();
            assert_eq!(parked(&session).await, Some(Value::Bool(false)));
            assert_eq!(handle.status(), OperationStatus::InProgress);
        }

        session.poll_now().await.unwrap();
        assert_eq!(parked(&session).await, Some(Value::Bool(true)));
        assert_eq!(handle.status(), OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_parked_mount_rejects_slew() {
        let (session, _, _) = session_with(
            "alpaca-telescope",
            TelescopeSim::new(0.0, 90.0).parked(),
            timing(),
        );
        session.connect().await.unwrap();
        let parked = session.get_property("parked").await.unwrap();
        assert_eq!(parked.value, Some(Value::Bool(true)));

        let err = session
            .submit(Intent::SlewTo { ra: 5.5, dec: 20.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(session.current_operation().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_byte_leaves_store_untouched() {
        let (session, _, connector) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();
        let before = session.snapshot().await;

        connector.inject(|faults| faults.drop_byte = Some(4));
        let err = session.submit(Intent::MoveAbsolute(2000)).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::TransportFailure(DriverError::Codec(CodecError::ChecksumMismatch { .. }))
        ));

        assert_eq!(session.snapshot().await, before);
        assert_eq!(session.get_property("target").await.unwrap().value, None);
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_single_operation_in_flight() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();

        let first = session.submit(Intent::MoveAbsolute(3000)).await.unwrap();
        for target in [100, 2000, 5000] {
            assert!(matches!(
                session.submit(Intent::MoveAbsolute(target)).await,
                Err(DispatchError::Busy(_))
            ));
        }
        let current = session.current_operation().await.unwrap();
        assert_eq!(&current.id, first.id());
    }

    #[tokio::test]
    async fn test_abort_without_operation_is_noop() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();
        session.abort().await.unwrap();
        session.abort().await.unwrap();
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(session.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_abort_holds_submits_until_halt_confirmed() {
        let (session, sim, _) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();
        let handle = session.submit(Intent::MoveAbsolute(3000)).await.unwrap();
        session.poll_now().await.unwrap();

        session.abort().await.unwrap();
        assert_eq!(handle.status(), OperationStatus::Aborted);
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(!sim.lock().unwrap().is_moving());
        assert!(matches!(
            session.submit(Intent::MoveAbsolute(1500)).await,
            Err(DispatchError::Busy(_))
        ));

        session.poll_now().await.unwrap();
        let history = session.history().await;
        assert_eq!(history.last().unwrap().status, OperationStatus::Aborted);
        session.submit(Intent::MoveAbsolute(1500)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_not_confirmed_faults() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000).ignore_halt());
        session.connect().await.unwrap();
        let handle = session.submit(Intent::MoveAbsolute(9000)).await.unwrap();
        session.abort().await.unwrap();

        session.poll_now().await.unwrap();
        assert_eq!(handle.status(), OperationStatus::Aborted);

        tokio::time::advance(Duration::from_millis(1200)).await;
        session.poll_now().await.unwrap();
        assert_eq!(handle.status(), OperationStatus::Failed(ErrorKind::DeviceFault));
        assert_eq!(session.state().await, SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_power_loss_faults_and_reset_waits_for_recovery() {
        let (session, sim, _) = session_with("dome", DomeSim::new(10.0), timing());
        session.connect().await.unwrap();
        let handle = session.submit(Intent::RotateTo(90.0)).await.unwrap();
        session.poll_now().await.unwrap();

        sim.lock().unwrap().set_battery(6.5);
        session.poll_now().await.unwrap();
        let op = handle.wait().await;
        assert_eq!(op.status, OperationStatus::Failed(ErrorKind::ResourceUnavailable));
        assert_eq!(session.state().await, SessionState::Faulted);

        assert!(matches!(session.reset().await, Err(SessionError::StillFaulted(_))));
        assert_eq!(session.state().await, SessionState::Faulted);

        sim.lock().unwrap().set_battery(12.0);
        session.reset().await.unwrap();
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(session.fault_reason().await.is_none());
    }

    #[tokio::test]
    async fn test_parked_dome_holds_until_unparked() {
        let (session, sim, _) = session_with("dome", DomeSim::new(160.0), timing());
        session.connect().await.unwrap();
        let park = session.submit(Intent::Park).await.unwrap();
        assert_eq!(parked(&session).await, Some(Value::Bool(false)));
        for _ in 0..2 {
            session.poll_now().await.unwrap();
        }
        assert_eq!(park.status(), OperationStatus::Completed);
        assert_eq!(parked(&session).await, Some(Value::Bool(true)));

        for intent in [Intent::RotateTo(90.0), Intent::FindHome, Intent::OpenShutter] {
            assert!(matches!(session.submit(intent).await, Err(DispatchError::Rejected(_))));
        }

        sim.lock().unwrap().set_battery(6.5);
        session.poll_now().await.unwrap();
        assert!(matches!(
            session.submit(Intent::Unpark).await,
            Err(DispatchError::Rejected(_))
        ));

        sim.lock().unwrap().set_battery(12.0);
        session.poll_now().await.unwrap();
        let unpark = session.submit(Intent::Unpark).await.unwrap();
        session.poll_now().await.unwrap();
        assert_eq!(unpark.status(), OperationStatus::Completed);
        assert_eq!(parked(&session).await, Some(Value::Bool(false)));
        assert!(session.submit(Intent::RotateTo(90.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_fails_operation_and_reconnect_resets_store() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();
        let handle = session.submit(Intent::MoveAbsolute(1500)).await.unwrap();

        session.disconnect().await.unwrap();
        assert_eq!(
            handle.status(),
            OperationStatus::Failed(ErrorKind::ResourceUnavailable)
        );
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert_eq!(
            session.get_property("position").await.unwrap().validity,
            Validity::Stale
        );
        assert!(matches!(
            session.submit(Intent::MoveAbsolute(1200)).await,
            Err(DispatchError::NotConnected)
        ));
        session.disconnect().await.unwrap();

        session.connect().await.unwrap();
        let position = session.get_property("position").await.unwrap();
        assert_eq!(position.validity, Validity::Valid);
        assert_eq!(session.get_property("target").await.unwrap().value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_return_to_disconnected() {
        let (session, _, connector) = focuser(FrameFocuserSim::new(0));

        connector.inject(|faults| faults.refuse_open = Some(ConnectError::Busy("claimed".into())));
        assert!(matches!(
            session.connect().await,
            Err(SessionError::Connect(ConnectError::Busy(_)))
        ));
        assert_eq!(session.state().await, SessionState::Disconnected);

        connector.inject(|faults| faults.silent = true);
        assert!(matches!(
            session.connect().await,
            Err(SessionError::Connect(ConnectError::HandshakeFailed(_)))
        ));
        assert_eq!(session.state().await, SessionState::Disconnected);

        connector.heal();
        session.connect().await.unwrap();
        assert!(session.device_info().await.unwrap().firmware.starts_with("FF-SIM"));
        assert!(matches!(
            session.connect().await,
            Err(SessionError::AlreadyConnected(SessionState::Idle))
        ));
        assert!(matches!(
            session.reset().await,
            Err(SessionError::NotFaulted(SessionState::Idle))
        ));
    }

    #[tokio::test]
    async fn test_poll_failure_marks_properties_stale() {
        let (session, _, connector) = focuser(FrameFocuserSim::new(1000));
        session.connect().await.unwrap();

        connector.inject(|faults| faults.unplugged = true);
        assert!(matches!(
            session.poll_now().await,
            Err(DispatchError::TransportFailure(DriverError::Transport(TransportError::Io(_))))
        ));
        let position = session.get_property("position").await.unwrap();
        assert_eq!(position.validity, Validity::Stale);
        assert_eq!(position.value, Some(Value::Int(1000)));
        assert!(session.get_property("no_such_key").await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = session.subscribe("position", {
            let calls = Arc::clone(&calls);
            move |change: &PropertyChange| {
                assert_eq!(change.key, "position");
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        session.connect().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session.submit(Intent::MoveAbsolute(1300)).await.unwrap();
        session.poll_now().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(subscription);
        session.poll_now().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_event_stream_and_bus() {
        let (session, _, _) = focuser(FrameFocuserSim::new(1000));
        let bus = SharedEventBus::new();
        session.attach_event_bus(bus.clone());
        let mut on_bus = bus.subscribe::<SessionEvent>().unwrap();
        let mut events = session.events();

        session.connect().await.unwrap();

        let first = events.try_recv().unwrap();
        assert!(matches!(
            first.kind,
            SessionEventKind::StateChanged {
                from: SessionState::Disconnected,
                to: SessionState::Handshaking
            }
        ));
        assert_eq!(first.device, "test");
        assert_eq!(&first.session, session.id());

        let mut saw_idle = false;
        let mut saw_position = false;
        while let Ok(event) = events.try_recv() {
            match event.kind {
                SessionEventKind::StateChanged { to: SessionState::Idle, .. } => saw_idle = true,
                SessionEventKind::PropertyChanged(change) if change.key == "position" => saw_position = true,
                _ => {}
            }
        }
        assert!(saw_idle && saw_position);
        assert!(on_bus.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_poller_drives_completion() {
        let timing = SessionDefaults {
            autopoll: true,
            ..timing()
        };
        let (session, _, _) = session_with("frame-focuser", FrameFocuserSim::new(1000), timing);
        session.connect().await.unwrap();

        let handle = session.submit(Intent::MoveAbsolute(1500)).await.unwrap();
        let op = tokio::time::timeout(Duration::from_secs(30), handle.wait())
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Completed);

        session.disconnect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Disconnected);
    }
}
