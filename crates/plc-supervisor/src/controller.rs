//! Connection lifecycle, command dispatch and status polling for one device.
//!
//! Each connected controller runs one background poll thread. Foreground calls
//! (`write_command`, `get_status`, `disconnect`) may come from any thread. All
//! link traffic goes through a single link lock, and the connection state lives
//! behind its own lock; when both are needed the link lock is taken first.
//!
//! Every successful `connect` starts a new session. Poll results and pending
//! reverts carry the session they belong to and are dropped once it has ended.

use crate::audit::AuditLog;
use crate::decode::{self, StatusIndicator};
use crate::error::{ConnectError, WriteError};
use crate::metrics::{DeviceMetrics, SupervisorMetrics};
use crate::types::{ConnectionState, DeviceProfile, Timing};
use plc_link::{DeviceLink, LinkError, Register};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every controller of a deployment.
#[derive(Clone)]
pub struct SupervisorContext {
    pub audit: Arc<dyn AuditLog>,
    pub metrics: Option<SupervisorMetrics>,
    pub timing: Timing,
}

impl SupervisorContext {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self {
            audit,
            metrics: None,
            timing: Timing::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: SupervisorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

/// Point-in-time view of one device, for UIs and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub address: String,
    pub connection: ConnectionState,
    pub status: u8,
    pub indicators: Vec<StatusIndicator>,
}

struct LiveState {
    connection: ConnectionState,
    session: u64,
    // bumped on every command write; a revert only fires if it is still current
    command_seq: u64,
    current: u8,
    // last value read in any session; None only before the very first read
    previous: Option<u8>,
}

struct Shared {
    id: String,
    link: Mutex<Box<dyn DeviceLink>>,
    state: Mutex<LiveState>,
    ctx: SupervisorContext,
}

struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-device timer thread that applies pending reverts when they fall due.
struct Reverter {
    queue: Sender<PendingRevert>,
    handle: JoinHandle<()>,
}

impl Reverter {
    /// Close the queue and wait for the worker. Reverts still pending are dropped.
    fn stop(self, device: &str) {
        drop(self.queue);
        if self.handle.join().is_err() {
            error!(device, "revert worker panicked");
        }
    }
}

impl Poller {
    /// Signal the loop and wait until it has returned.
    fn stop(self, device: &str) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!(device, "status poller panicked");
        }
    }
}

pub struct DeviceController {
    address: String,
    profile: DeviceProfile,
    shared: Arc<Shared>,
    poller: Mutex<Option<Poller>>,
    reverter: Mutex<Option<Reverter>>,
}

impl DeviceController {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        profile: DeviceProfile,
        link: Box<dyn DeviceLink>,
        ctx: SupervisorContext,
    ) -> Self {
        Self {
            address: address.into(),
            profile,
            shared: Arc::new(Shared {
                id: id.into(),
                link: Mutex::new(link),
                state: Mutex::new(LiveState {
                    connection: ConnectionState::Disconnected,
                    session: 0,
                    command_seq: 0,
                    current: 0,
                    previous: None,
                }),
                ctx,
            }),
            poller: Mutex::new(None),
            reverter: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Command names in stable order.
    pub fn commands(&self) -> Vec<&str> {
        self.profile.commands.keys().map(String::as_str).collect()
    }

    /// Single bounded connection attempt. Starts status polling on success.
    ///
    /// Calling this while connected is a no-op.
    pub fn connect(&self) -> Result<(), ConnectError> {
        let mut poller = lock(&self.poller);
        if self.is_connected() {
            debug!(device = %self.id(), "already connected");
            return Ok(());
        }
        // reap a loop that ended by itself after a read failure
        if let Some(p) = poller.take() {
            p.stop(self.id());
        }

        let timeout = self.shared.ctx.timing.connect_timeout;
        let link_info = {
            let mut link = self.shared.lock_link();
            if link.is_connected() {
                if let Err(e) = link.disconnect() {
                    warn!(device = %self.id(), error = %e, "closing stale link failed");
                }
            }
            if let Err(source) = link.connect(&self.address, timeout) {
                error!(device = %self.id(), address = %self.address, error = %source, "connection failed");
                self.shared.count(|m| m.connect_failures.inc());
                return Err(ConnectError::Link {
                    device: self.id().to_string(),
                    source,
                });
            }
            if !link.is_connected() {
                error!(device = %self.id(), address = %self.address, "link did not come up");
                self.shared.count(|m| m.connect_failures.inc());
                return Err(ConnectError::NotReported {
                    device: self.id().to_string(),
                });
            }
            link.describe()
        };

        let session = {
            let mut st = self.shared.lock_state();
            st.session += 1;
            st.connection = ConnectionState::Connected;
            st.session
        };
        info!(device = %self.id(), link = %link_info, "connected");
        self.shared.count(|m| m.devices_connected.inc());
        self.shared.record_lifecycle("Connected");

        let (stop, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let register = self.profile.status_register;
        let interval = self.shared.ctx.timing.poll_interval;
        let spawned = thread::Builder::new()
            .name(format!("poll-{}", self.id()))
            .spawn(move || poll_loop(shared, session, register, interval, stop_rx));
        match spawned {
            Ok(handle) => {
                *poller = Some(Poller { stop, handle });
                Ok(())
            }
            Err(source) => {
                error!(device = %self.id(), error = %source, "could not start status polling");
                self.shared.lock_state().connection = ConnectionState::Disconnected;
                if let Err(e) = self.shared.lock_link().disconnect() {
                    warn!(device = %self.id(), error = %e, "closing link failed");
                }
                self.shared.count(|m| m.devices_connected.dec());
                self.shared.record_lifecycle("Disconnected");
                Err(ConnectError::Spawn {
                    device: self.id().to_string(),
                    source,
                })
            }
        }
    }

    /// Stop polling, wait for the poll thread to finish, then close the link.
    ///
    /// Once this returns nothing touches the link until the next `connect`.
    pub fn disconnect(&self) {
        let mut poller = lock(&self.poller);
        let was_connected = {
            let mut st = self.shared.lock_state();
            let was = st.connection == ConnectionState::Connected;
            st.connection = ConnectionState::Disconnected;
            was
        };
        if let Some(p) = poller.take() {
            p.stop(self.id());
        }
        let link_open = {
            let mut link = self.shared.lock_link();
            let open = link.is_connected();
            if open {
                if let Err(e) = link.disconnect() {
                    warn!(device = %self.id(), error = %e, "closing link failed");
                }
            }
            open
        };
        if was_connected {
            self.shared.count(|m| m.devices_connected.dec());
        }
        if was_connected || link_open {
            info!(device = %self.id(), "disconnected");
            self.shared.record_lifecycle("Disconnected");
        }
    }

    /// Write the named command's bit pattern to the command register.
    ///
    /// Momentary commands are followed, `revert_delay` later, by a write of the
    /// idle pattern. The revert is queued on the device's revert worker; it is
    /// skipped if the session ended or another command was written in the meantime.
    pub fn write_command(&self, name: &str, revert_delay: Duration) -> Result<(), WriteError> {
        let device = self.id();
        let session = self
            .shared
            .live_session()
            .ok_or_else(|| WriteError::NotConnected(device.to_string()))?;
        let pattern = self
            .profile
            .commands
            .get(name)
            .ok_or_else(|| WriteError::UnknownCommand {
                device: device.to_string(),
                command: name.to_string(),
            })?
            .value();
        let register = self.profile.command_register;

        let seq = {
            let mut link = self.shared.lock_link();
            let mut st = self.shared.lock_state();
            if !st.is_live(session) {
                return Err(WriteError::NotConnected(device.to_string()));
            }
            st.command_seq += 1;
            let seq = st.command_seq;
            drop(st);
            link.write(register, pattern)
                .map_err(|source| {
                    warn!(device, command = name, error = %source, "command write failed");
                    WriteError::Link {
                        device: device.to_string(),
                        source,
                    }
                })?;
            seq
        };
        info!(device, command = name, pattern = %format!("0b{pattern:08b}"), %register, "command written");
        self.shared.count(|m| m.commands_written.inc());
        self.shared
            .record_lifecycle(&format!("Wrote command {name} (0b{pattern:08b}) to {register}"));

        if self.profile.is_momentary(name) {
            self.schedule_revert(session, seq, revert_delay)?;
        }
        Ok(())
    }

    /// [`write_command`](Self::write_command) with the profile's revert delay.
    pub fn send(&self, name: &str) -> Result<(), WriteError> {
        self.write_command(name, self.profile.revert_delay())
    }

    fn schedule_revert(&self, session: u64, seq: u64, delay: Duration) -> Result<(), WriteError> {
        let pending = PendingRevert {
            due: Instant::now() + delay,
            session,
            seq,
            register: self.profile.command_register,
            idle: self.profile.idle_pattern(),
        };
        let mut reverter = lock(&self.reverter);
        if let Some(r) = reverter.as_ref() {
            if r.queue.send(pending).is_ok() {
                return Ok(());
            }
            // the worker is gone; reap it and start a fresh one
            if let Some(dead) = reverter.take() {
                dead.stop(self.id());
            }
        }

        let (queue, rx) = mpsc::channel();
        // rx is still held here, so this cannot fail
        let _ = queue.send(pending);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("revert-{}", self.id()))
            .spawn(move || revert_worker(shared, rx));
        match spawned {
            Ok(handle) => {
                *reverter = Some(Reverter { queue, handle });
                Ok(())
            }
            Err(source) => {
                error!(device = %self.id(), error = %source, "could not start revert worker, reverting now");
                self.shared.revert(pending);
                Err(WriteError::RevertNotScheduled {
                    device: self.id().to_string(),
                    source,
                })
            }
        }
    }

    /// Last observed status byte. Never touches the link.
    pub fn get_status(&self) -> u8 {
        self.shared.lock_state().current
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock_state().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Display label derived from the connection state.
    pub fn connection_label(&self) -> &'static str {
        match self.connection_state() {
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Unreachable",
        }
    }

    pub fn status_indicators(&self) -> Vec<StatusIndicator> {
        let (connection, status) = self.shared.view();
        decode::indicators(
            connection == ConnectionState::Connected,
            status,
            &self.profile.status_bits,
        )
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let (connection, status) = self.shared.view();
        DeviceSnapshot {
            id: self.id().to_string(),
            address: self.address.clone(),
            connection,
            status,
            indicators: decode::indicators(
                connection == ConnectionState::Connected,
                status,
                &self.profile.status_bits,
            ),
        }
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.poller)
            .as_ref()
            .map(|p| !p.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        let active = self.is_connected()
            || lock(&self.poller).is_some()
            || self.shared.lock_link().is_connected();
        if active {
            self.disconnect();
        }
        let reverter = self
            .reverter
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(r) = reverter {
            r.stop(self.id());
        }
    }
}

#[derive(Clone, Copy)]
struct PendingRevert {
    due: Instant,
    session: u64,
    seq: u64,
    register: Register,
    idle: u8,
}

impl LiveState {
    fn is_live(&self, session: u64) -> bool {
        self.connection == ConnectionState::Connected && self.session == session
    }
}

impl Shared {
    fn lock_link(&self) -> MutexGuard<'_, Box<dyn DeviceLink>> {
        lock(&self.link)
    }

    fn lock_state(&self) -> MutexGuard<'_, LiveState> {
        lock(&self.state)
    }

    fn live_session(&self) -> Option<u64> {
        let st = self.lock_state();
        (st.connection == ConnectionState::Connected).then_some(st.session)
    }

    fn view(&self) -> (ConnectionState, u8) {
        let st = self.lock_state();
        (st.connection, st.current)
    }

    fn count(&self, f: impl FnOnce(&DeviceMetrics)) {
        if let Some(m) = &self.ctx.metrics {
            f(&m.dev);
        }
    }

    fn record_lifecycle(&self, event: &str) {
        let res = self
            .ctx
            .audit
            .record_lifecycle_event(OffsetDateTime::now_utc(), &self.id, event);
        if let Err(e) = res {
            warn!(device = %self.id, event, error = %e, "audit lifecycle record failed");
            self.count(|m| m.audit_failures.inc());
        }
    }

    fn record_status(&self, status: u8) {
        let res = self
            .ctx
            .audit
            .record_status_change(OffsetDateTime::now_utc(), &self.id, status);
        if let Err(e) = res {
            warn!(device = %self.id, status, error = %e, "audit status record failed");
            self.count(|m| m.audit_failures.inc());
        }
    }

    /// Apply one poll result. Only the poll thread calls this, so records come
    /// out in observation order.
    fn observe(&self, session: u64, value: u8) {
        let change = {
            let mut st = self.lock_state();
            if !st.is_live(session) {
                return;
            }
            st.current = value;
            match st.previous.replace(value) {
                Some(prev) if prev != value => Some(prev),
                Some(_) => None,
                None => {
                    debug!(device = %self.id, status = value, "status baseline");
                    None
                }
            }
        };
        if let Some(prev) = change {
            info!(
                device = %self.id,
                from = %format!("0b{prev:08b}"),
                to = %format!("0b{value:08b}"),
                "status changed"
            );
            self.count(|m| m.status_changes.inc());
            self.record_status(value);
        }
    }

    fn mark_lost(&self, session: u64, err: &LinkError) {
        let lost = {
            let mut st = self.lock_state();
            if st.is_live(session) {
                st.connection = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if lost {
            error!(device = %self.id, error = %err, "status read failed, device marked disconnected");
            self.count(|m| {
                m.links_lost.inc();
                m.devices_connected.dec();
            });
            self.record_lifecycle(&format!("Connection lost: {err}"));
        }
    }

    fn revert(&self, pending: PendingRevert) {
        let PendingRevert {
            session,
            seq,
            register,
            idle,
            ..
        } = pending;
        let outcome = {
            let mut link = self.lock_link();
            let st = self.lock_state();
            if !st.is_live(session) {
                Err("session ended")
            } else if st.command_seq != seq {
                Err("superseded by a newer command")
            } else {
                drop(st);
                Ok(link.write(register, idle))
            }
        };
        match outcome {
            Err(reason) => {
                debug!(device = %self.id, reason, "revert skipped");
                self.count(|m| m.reverts_skipped.inc());
            }
            Ok(Ok(())) => {
                info!(device = %self.id, pattern = %format!("0b{idle:08b}"), %register, "reverted to idle");
                self.count(|m| m.reverts_written.inc());
                self.record_lifecycle(&format!("Wrote command 0b{idle:08b} to {register} (revert)"));
            }
            Ok(Err(e)) => {
                warn!(device = %self.id, error = %e, "revert write failed");
            }
        }
    }
}

fn poll_loop(
    shared: Arc<Shared>,
    session: u64,
    register: Register,
    interval: Duration,
    stop: Receiver<()>,
) {
    debug!(device = %shared.id, %register, "status polling started");
    loop {
        let read = shared.lock_link().read(register);
        match read {
            Ok(value) => shared.observe(session, value),
            Err(e) => {
                shared.mark_lost(session, &e);
                break;
            }
        }
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(device = %shared.id, "status polling stopped");
}

/// Applies queued reverts in due order until the controller closes the queue.
fn revert_worker(shared: Arc<Shared>, queue: Receiver<PendingRevert>) {
    let mut pending: Vec<PendingRevert> = Vec::new();
    loop {
        let next_due = pending.iter().map(|p| p.due).min();
        let received = match next_due {
            Some(due) => queue.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => queue.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(p) => pending.push(p),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        let (mut ready, waiting): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|p| p.due <= now);
        pending = waiting;
        ready.sort_by_key(|p| (p.due, p.seq));
        for p in ready {
            shared.revert(p);
        }
    }
    debug!(device = %shared.id, dropped = pending.len(), "revert worker stopped");
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::error::AuditError;
    use crate::types::{BitPattern, CommandMap, StatusLabels};
    use plc_link::{LinkInfo, LinkOp, SimulatedLink};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast() -> Timing {
        Timing {
            poll_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(50),
        }
    }

    fn kum_profile() -> DeviceProfile {
        let mut commands = CommandMap::new();
        commands.insert("open".into(), BitPattern::new(0b0000011));
        commands.insert("close".into(), BitPattern::new(0b0000101));
        commands.insert("estop".into(), BitPattern::new(0b0010000));
        commands.insert("none".into(), BitPattern::new(0));
        let labels: StatusLabels = [(0, "Estop"), (1, "Dir"), (2, "Run")]
            .into_iter()
            .map(|(b, l)| (b, l.to_string()))
            .collect();
        DeviceProfile::new(commands, labels, Register::STATUS)
    }

    fn controller(link: &SimulatedLink, audit: Arc<dyn AuditLog>) -> DeviceController {
        let ctx = SupervisorContext::new(audit).with_timing(fast());
        DeviceController::new(
            "KUM1",
            "192.168.0.11",
            kum_profile(),
            Box::new(link.clone()),
            ctx,
        )
    }

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    const WAIT: Duration = Duration::from_secs(3);

    #[test]
    fn write_while_disconnected_is_rejected() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        for cmd in ["open", "none", "does-not-exist"] {
            let err = dev.write_command(cmd, Duration::ZERO).unwrap_err();
            assert!(matches!(err, WriteError::NotConnected(ref id) if id == "KUM1"));
        }
        assert!(link.writes().is_empty());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        let err = dev.write_command("launch", Duration::ZERO).unwrap_err();
        assert!(matches!(err, WriteError::UnknownCommand { ref command, .. } if command == "launch"));
        assert!(link.writes().is_empty());
        assert!(dev.is_connected());
        dev.disconnect();
    }

    #[test]
    fn only_transitions_are_audited() {
        let link = SimulatedLink::new();
        link.script_reads(Register::STATUS, &[5, 5, 5, 7, 7, 2]);
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());
        dev.connect().unwrap();

        assert!(wait_until(WAIT, || link.reads().len() >= 9));
        dev.disconnect();

        assert_eq!(audit.status_changes("KUM1"), vec![7, 2]);
        assert_eq!(dev.get_status(), 2);
    }

    #[test]
    fn disconnect_waits_for_poller() {
        let link = SimulatedLink::new();
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());
        dev.connect().unwrap();
        assert!(dev.is_polling());
        assert!(wait_until(WAIT, || link.reads().len() >= 3));

        dev.disconnect();
        let returned = Instant::now();
        assert!(!dev.is_polling());
        assert!(!dev.is_connected());

        thread::sleep(Duration::from_millis(60));
        let calls = link.calls();
        assert!(calls.iter().all(|c| c.at <= returned));
        let close = calls
            .iter()
            .position(|c| c.op == LinkOp::Disconnect)
            .unwrap();
        assert!(calls[close..]
            .iter()
            .all(|c| !matches!(c.op, LinkOp::Read(_))));
        assert_eq!(
            audit.lifecycle_events("KUM1"),
            vec!["Connected".to_string(), "Disconnected".to_string()]
        );
    }

    #[test]
    fn read_failure_drops_to_disconnected_without_retry() {
        let link = SimulatedLink::new();
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());
        dev.connect().unwrap();
        assert!(wait_until(WAIT, || link.reads().len() >= 1));

        link.fail_reads(true);
        assert!(wait_until(WAIT, || !dev.is_connected()));
        assert!(wait_until(WAIT, || !dev.is_polling()));
        let reads_after_loss = link.reads().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(link.reads().len(), reads_after_loss);

        let connects = link
            .calls()
            .iter()
            .filter(|c| matches!(c.op, LinkOp::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(dev.status_indicators(), vec![StatusIndicator::not_connected()]);
        assert_eq!(dev.connection_label(), "Unreachable");
        assert!(matches!(
            dev.write_command("open", Duration::ZERO),
            Err(WriteError::NotConnected(_))
        ));
        let events = audit.lifecycle_events("KUM1");
        assert!(events[1].starts_with("Connection lost"));

        // an explicit connect brings it back
        link.fail_reads(false);
        dev.connect().unwrap();
        assert!(dev.is_connected());
        assert!(dev.is_polling());
        dev.disconnect();
    }

    #[test]
    fn momentary_command_reverts_without_blocking() {
        let link = SimulatedLink::new();
        link.set_register(Register::STATUS, 0b100);
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        assert!(wait_until(WAIT, || dev.get_status() == 0b100));

        let started = Instant::now();
        dev.write_command("open", Duration::from_millis(100)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(80));

        while link.writes().len() < 2 && started.elapsed() < WAIT {
            let t = Instant::now();
            assert_eq!(dev.get_status(), 0b100);
            assert!(t.elapsed() < Duration::from_millis(20));
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            link.writes(),
            vec![(Register::COMMAND, 0b0000011), (Register::COMMAND, 0)]
        );
        let writes = link.write_calls();
        assert!(writes[1].at.duration_since(writes[0].at) >= Duration::from_millis(100));
        dev.disconnect();
    }

    #[test]
    fn plain_command_has_no_revert() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        dev.write_command("none", Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(link.writes(), vec![(Register::COMMAND, 0)]);
        dev.disconnect();
    }

    #[test]
    fn revert_skipped_after_disconnect() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        dev.write_command("estop", Duration::from_millis(50)).unwrap();
        dev.disconnect();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(link.writes(), vec![(Register::COMMAND, 0b0010000)]);
    }

    #[test]
    fn revert_skipped_after_reconnect() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        dev.write_command("open", Duration::from_millis(60)).unwrap();
        dev.disconnect();
        dev.connect().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(link.writes(), vec![(Register::COMMAND, 0b0000011)]);
        dev.disconnect();
    }

    #[test]
    fn newer_command_supersedes_pending_revert() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        dev.write_command("open", Duration::from_millis(60)).unwrap();
        thread::sleep(Duration::from_millis(20));
        dev.write_command("close", Duration::from_millis(60)).unwrap();
        assert!(wait_until(WAIT, || link.writes().len() >= 3));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            link.writes(),
            vec![
                (Register::COMMAND, 0b0000011),
                (Register::COMMAND, 0b0000101),
                (Register::COMMAND, 0),
            ]
        );
        dev.disconnect();
    }

    struct BrokenAudit;

    impl AuditLog for BrokenAudit {
        fn record_lifecycle_event(
            &self,
            _ts: OffsetDateTime,
            _device_id: &str,
            _event: &str,
        ) -> Result<(), AuditError> {
            Err(AuditError::Storage("disk full".into()))
        }

        fn record_status_change(
            &self,
            _ts: OffsetDateTime,
            _device_id: &str,
            _status: u8,
        ) -> Result<(), AuditError> {
            Err(AuditError::Storage("disk full".into()))
        }
    }

    #[test]
    fn audit_failures_are_swallowed() {
        let link = SimulatedLink::new();
        link.script_reads(Register::STATUS, &[1, 2]);
        let metrics = SupervisorMetrics::new().unwrap();
        let ctx = SupervisorContext::new(Arc::new(BrokenAudit))
            .with_timing(fast())
            .with_metrics(metrics.clone());
        let dev = DeviceController::new("KUM1", "plc", kum_profile(), Box::new(link.clone()), ctx);

        dev.connect().unwrap();
        dev.write_command("none", Duration::ZERO).unwrap();
        assert!(wait_until(WAIT, || dev.get_status() == 2));
        dev.disconnect();

        assert_eq!(link.writes(), vec![(Register::COMMAND, 0)]);
        assert_eq!(metrics.dev.status_changes.get(), 1);
        // connected, command, status change, disconnected
        assert_eq!(metrics.dev.audit_failures.get(), 4);
    }

    #[test]
    fn connect_twice_is_a_noop() {
        let link = SimulatedLink::new();
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());
        dev.connect().unwrap();
        dev.connect().unwrap();
        let connects = link
            .calls()
            .iter()
            .filter(|c| matches!(c.op, LinkOp::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(audit.lifecycle_events("KUM1"), vec!["Connected".to_string()]);
        dev.disconnect();
    }

    #[test]
    fn failed_connect_stays_disconnected() {
        let link = SimulatedLink::new();
        link.fail_connect(true);
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());

        let err = dev.connect().unwrap_err();
        assert!(matches!(err, ConnectError::Link { ref device, .. } if device == "KUM1"));
        assert!(!dev.is_connected());
        assert!(!dev.is_polling());
        assert!(audit.records().is_empty());
        thread::sleep(Duration::from_millis(30));
        assert!(link.reads().is_empty());
    }

    #[test]
    fn snapshot_reflects_live_state() {
        let link = SimulatedLink::new();
        link.set_register(Register::STATUS, 0b101);
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        assert_eq!(dev.snapshot().indicators, vec![StatusIndicator::not_connected()]);

        dev.connect().unwrap();
        assert!(wait_until(WAIT, || dev.get_status() == 0b101));
        let snap = dev.snapshot();
        assert_eq!(snap.connection, ConnectionState::Connected);
        assert_eq!(dev.connection_label(), "Connected");
        assert_eq!(
            snap.indicators,
            vec![
                StatusIndicator::new("Estop", true),
                StatusIndicator::new("Dir", false),
                StatusIndicator::new("Run", true),
            ]
        );
        assert_eq!(dev.commands(), vec!["close", "estop", "none", "open"]);
        dev.disconnect();
    }

    #[test]
    fn drop_closes_the_link() {
        let link = SimulatedLink::new();
        {
            let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
            dev.connect().unwrap();
        }
        assert!(!link.is_connected());
    }

    #[test]
    fn status_change_across_reconnect_is_audited() {
        let link = SimulatedLink::new();
        link.set_register(Register::STATUS, 5);
        let audit = Arc::new(MemoryAuditLog::new());
        let dev = controller(&link, audit.clone());

        dev.connect().unwrap();
        assert!(wait_until(WAIT, || dev.get_status() == 5));
        dev.disconnect();

        link.set_register(Register::STATUS, 7);
        dev.connect().unwrap();
        assert!(wait_until(WAIT, || dev.get_status() == 7));
        dev.disconnect();
        assert_eq!(audit.status_changes("KUM1"), vec![7]);

        // same value after another reconnect: nothing new
        let reads = link.reads().len();
        dev.connect().unwrap();
        assert!(wait_until(WAIT, || link.reads().len() >= reads + 2));
        dev.disconnect();
        assert_eq!(audit.status_changes("KUM1"), vec![7]);
    }

    #[test]
    fn shorter_revert_fires_first() {
        let link = SimulatedLink::new();
        let dev = controller(&link, Arc::new(MemoryAuditLog::new()));
        dev.connect().unwrap();
        dev.write_command("open", Duration::from_millis(300)).unwrap();
        dev.write_command("estop", Duration::from_millis(20)).unwrap();
        assert!(wait_until(WAIT, || link.writes().len() >= 3));

        let writes = link.write_calls();
        assert!(writes[2].at.duration_since(writes[1].at) < Duration::from_millis(250));
        thread::sleep(Duration::from_millis(350));
        assert_eq!(
            link.writes(),
            vec![
                (Register::COMMAND, 0b0000011),
                (Register::COMMAND, 0b0010000),
                (Register::COMMAND, 0),
            ]
        );
        dev.disconnect();
    }

    struct TrackedLink {
        inner: SimulatedLink,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for TrackedLink {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl DeviceLink for TrackedLink {
        fn connect(&mut self, address: &str, timeout: Duration) -> plc_link::Result<()> {
            self.inner.connect(address, timeout)
        }

        fn disconnect(&mut self) -> plc_link::Result<()> {
            self.inner.disconnect()
        }

        fn write(&mut self, register: Register, value: u8) -> plc_link::Result<()> {
            self.inner.write(register, value)
        }

        fn read(&mut self, register: Register) -> plc_link::Result<u8> {
            self.inner.read(register)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn describe(&self) -> LinkInfo {
            self.inner.describe()
        }
    }

    #[test]
    fn drop_releases_link_with_revert_pending() {
        let link = SimulatedLink::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let tracked = TrackedLink {
            inner: link.clone(),
            dropped: dropped.clone(),
        };
        let ctx = SupervisorContext::new(Arc::new(MemoryAuditLog::new())).with_timing(fast());
        let dev = DeviceController::new("KUM1", "plc", kum_profile(), Box::new(tracked), ctx);
        dev.connect().unwrap();
        dev.write_command("open", Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        drop(dev);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!link.is_connected());
        assert_eq!(link.writes(), vec![(Register::COMMAND, 0b0000011)]);
    }

    #[test]
    fn pending_revert_does_not_block_other_devices() {
        let link_a = SimulatedLink::new();
        let link_b = SimulatedLink::new();
        link_b.set_register(Register::STATUS, 0b10);
        let audit = Arc::new(MemoryAuditLog::new());
        let a = controller(&link_a, audit.clone());
        let ctx = SupervisorContext::new(audit).with_timing(fast());
        let b = DeviceController::new("KUM2", "plc-b", kum_profile(), Box::new(link_b.clone()), ctx);
        a.connect().unwrap();
        b.connect().unwrap();
        assert!(wait_until(WAIT, || b.get_status() == 0b10));

        let started = Instant::now();
        a.write_command("open", Duration::from_millis(150)).unwrap();
        let t = Instant::now();
        b.write_command("none", Duration::ZERO).unwrap();
        assert!(t.elapsed() < Duration::from_millis(50));

        let mut samples = 0;
        while link_a.writes().len() < 2 && started.elapsed() < WAIT {
            let t = Instant::now();
            assert_eq!(b.get_status(), 0b10);
            assert_eq!(a.get_status(), 0);
            assert!(t.elapsed() < Duration::from_millis(20));
            samples += 1;
            thread::sleep(Duration::from_millis(5));
        }
        assert!(samples > 5);
        assert_eq!(
            link_a.writes(),
            vec![(Register::COMMAND, 0b0000011), (Register::COMMAND, 0)]
        );
        assert_eq!(link_b.writes(), vec![(Register::COMMAND, 0)]);
        a.disconnect();
        b.disconnect();
    }
}
