use log::{debug, warn};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::{Direction, Edge, LineConfig, WatchOptions};
use crate::error::GpioError;
use crate::poller::{Epoll, Interest, Poller, ReadyHandler, Timers};
use crate::sysfs::Sysfs;

/// Watch callback. Receives the value read after the edge, or the error that
/// prevented reading it. Identity for [`Line::unwatch`] is the `Arc` pointer.
pub type Listener = Arc<dyn Fn(Result<u8, GpioError>) + Send + Sync>;

/// How a line re-arms after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Fire once, then drop every listener.
    OneShot,
    /// Stay registered; the kernel reports every edge.
    Persistent,
    /// Stay subscribed, but re-arm only after the window has elapsed.
    PersistentDebounced(Duration),
}

impl WatchPolicy {
    pub fn from_options(options: &WatchOptions) -> Self {
        match (options.persistent_watch, options.debounce_timeout_ms) {
            (false, _) => WatchPolicy::OneShot,
            (true, 0) => WatchPolicy::Persistent,
            (true, ms) => WatchPolicy::PersistentDebounced(Duration::from_millis(ms)),
        }
    }

    pub fn interest(&self) -> Interest {
        match self {
            WatchPolicy::Persistent => Interest::PRIORITY,
            WatchPolicy::OneShot | WatchPolicy::PersistentDebounced(_) => {
                Interest::PRIORITY_ONESHOT
            }
        }
    }
}

/// An exported sysfs GPIO line.
///
/// The value file is opened once and kept for the lifetime of the line. Edge
/// notification is delivered to listeners registered with [`Line::watch`] on
/// the dispatch thread of the poller the line was opened with.
pub struct Line {
    inner: Arc<LineInner>,
}

struct LineInner {
    id: u32,
    sysfs: Sysfs,
    direction: RwLock<Direction>,
    options: WatchOptions,
    policy: WatchPolicy,
    value: Arc<File>,
    fd: RawFd,
    poller: Arc<dyn Poller>,
    timers: Arc<dyn Timers>,
    state: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    listeners: Vec<Listener>,
    debouncing: bool,
}

struct LineHandler {
    line: Weak<LineInner>,
}

impl ReadyHandler for LineHandler {
    fn on_ready(&self, readiness: Result<(), GpioError>) {
        if let Some(line) = self.line.upgrade() {
            line.deliver(readiness);
        }
    }
}

impl Line {
    /// Opens line `id` on the default sysfs root, using the process-wide
    /// epoll reactor.
    pub fn new(
        id: u32,
        direction: Direction,
        edge: Option<Edge>,
        options: WatchOptions,
    ) -> Result<Self, GpioError> {
        let epoll = Epoll::global()?;
        let config = LineConfig {
            id,
            direction,
            edge,
            options,
        };
        Self::open(&Sysfs::default(), epoll.clone(), epoll, config)
    }

    pub fn open(
        sysfs: &Sysfs,
        poller: Arc<dyn Poller>,
        timers: Arc<dyn Timers>,
        config: LineConfig,
    ) -> Result<Self, GpioError> {
        let LineConfig {
            id,
            direction,
            edge,
            options,
        } = config;

        // An already exported line keeps its kernel direction, so the write
        // guard has to follow that rather than the requested one.
        let direction = if sysfs.export(id, direction, edge)? {
            direction
        } else {
            sysfs
                .read_line_attr(id, "direction")
                .and_then(|raw| raw.parse())
                .map_err(|e| GpioError::Config(format!("gpio{id} direction: {e}")))?
        };
        let value = sysfs.open_value(id)?;
        // Clears any edge the kernel latched before we started listening.
        read_value(&value)
            .map_err(|e| GpioError::Config(format!("gpio{id} baseline: {e}")))?;

        let fd = value.as_raw_fd();
        Ok(Self {
            inner: Arc::new(LineInner {
                id,
                sysfs: sysfs.clone(),
                direction: RwLock::new(direction),
                options,
                policy: WatchPolicy::from_options(&options),
                value: Arc::new(value),
                fd,
                poller,
                timers,
                state: Mutex::new(WatchState::default()),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn options(&self) -> WatchOptions {
        self.inner.options
    }

    pub fn policy(&self) -> WatchPolicy {
        self.inner.policy
    }

    /// The descriptor registered with the poller.
    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn read_sync(&self) -> Result<u8, GpioError> {
        read_value(&self.inner.value)
    }

    pub fn write_sync(&self, value: u8) -> Result<(), GpioError> {
        self.check_writable(value)?;
        write_value(&self.inner.value, value)
    }

    /// Reads the value on the blocking pool. Dropping the future does not
    /// cancel a read that has already started.
    pub async fn read(&self) -> Result<u8, GpioError> {
        let file = self.inner.value.clone();
        tokio::task::spawn_blocking(move || read_value(&file))
            .await
            .map_err(|e| GpioError::Io(format!("read task: {e}")))?
    }

    /// Writes the value on the blocking pool. Dropping the future does not
    /// cancel a write that has already started.
    pub async fn write(&self, value: u8) -> Result<(), GpioError> {
        self.check_writable(value)?;
        let file = self.inner.value.clone();
        tokio::task::spawn_blocking(move || write_value(&file, value))
            .await
            .map_err(|e| GpioError::Io(format!("write task: {e}")))?
    }

    pub fn watch(&self, listener: Listener) -> Result<(), GpioError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.listeners.is_empty() {
            let handler = Arc::new(LineHandler {
                line: Arc::downgrade(inner),
            });
            inner.poller.add(inner.fd, inner.policy.interest(), handler)?;
            debug!("gpio{} armed ({:?})", inner.id, inner.policy);
        }
        state.listeners.push(listener);

        Ok(())
    }

    /// Removes every registration of `listener`.
    pub fn unwatch(&self, listener: &Listener) -> Result<(), GpioError> {
        let mut state = self.inner.state.lock();
        if state.listeners.is_empty() {
            return Ok(());
        }

        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if state.listeners.is_empty() {
            self.inner.disarm()?;
        }
        Ok(())
    }

    pub fn unwatch_all(&self) -> Result<(), GpioError> {
        let mut state = self.inner.state.lock();
        if state.listeners.is_empty() {
            return Ok(());
        }

        state.listeners.clear();
        self.inner.disarm()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Current direction as reported by the kernel. Lines configured as
    /// `out-high` or `out-low` read back as `out`.
    pub fn direction(&self) -> Result<Direction, GpioError> {
        self.inner
            .sysfs
            .read_line_attr(self.inner.id, "direction")?
            .parse()
    }

    pub fn set_direction(&self, direction: Direction) -> Result<(), GpioError> {
        self.inner
            .sysfs
            .write_line_attr(self.inner.id, "direction", direction.as_sysfs())?;
        *self.inner.direction.write() = direction;
        Ok(())
    }

    pub fn edge(&self) -> Result<Edge, GpioError> {
        self.inner.sysfs.read_line_attr(self.inner.id, "edge")?.parse()
    }

    pub fn set_edge(&self, edge: Edge) -> Result<(), GpioError> {
        self.inner
            .sysfs
            .write_line_attr(self.inner.id, "edge", edge.as_sysfs())
    }

    pub fn active_low(&self) -> Result<bool, GpioError> {
        let raw = self.inner.sysfs.read_line_attr(self.inner.id, "active_low")?;
        Ok(raw == "1")
    }

    pub fn set_active_low(&self, invert: bool) -> Result<(), GpioError> {
        self.inner.sysfs.write_line_attr(
            self.inner.id,
            "active_low",
            if invert { "1" } else { "0" },
        )
    }

    /// Stops watching, closes the value file and unexports the line.
    ///
    /// The line is unexported even if it could not be removed from the
    /// poller; that error is returned once the unexport has been written.
    pub fn unexport(self) -> Result<(), GpioError> {
        let unwatched = self.unwatch_all();
        if let Err(e) = &unwatched {
            warn!("gpio{}: unwatch before unexport failed: {e}", self.inner.id);
        }
        let id = self.inner.id;
        let sysfs = self.inner.sysfs.clone();
        drop(self);
        sysfs.unexport(id)?;
        unwatched
    }

    fn check_writable(&self, value: u8) -> Result<(), GpioError> {
        if value > 1 {
            return Err(GpioError::InvalidValue("Value must be 0 or 1".into()));
        }
        if !self.inner.direction.read().is_output() {
            return Err(GpioError::InvalidOperation(format!(
                "gpio{} is an input",
                self.inner.id
            )));
        }
        Ok(())
    }
}

impl LineInner {
    fn disarm(&self) -> Result<(), GpioError> {
        self.poller.remove(self.fd)?;
        debug!("gpio{} disarmed", self.id);
        Ok(())
    }

    fn deliver(self: Arc<Self>, readiness: Result<(), GpioError>) {
        let (listeners, result) = {
            let mut state = self.state.lock();
            if state.listeners.is_empty() {
                return;
            }

            match readiness {
                Ok(()) => {
                    let value = read_value(&self.value);
                    let snapshot = state.listeners.clone();
                    self.after_delivery(&mut state);
                    (snapshot, value)
                }
                // registration untouched, listeners decide whether to unwatch
                Err(e) => (state.listeners.clone(), Err(e)),
            }
        };

        for listener in listeners {
            listener(result.clone());
        }
    }

    fn after_delivery(self: &Arc<Self>, state: &mut WatchState) {
        match self.policy {
            WatchPolicy::OneShot => {
                state.listeners.clear();
                if let Err(e) = self.disarm() {
                    warn!("gpio{} disarm after delivery: {e}", self.id);
                }
            }
            WatchPolicy::Persistent => {}
            WatchPolicy::PersistentDebounced(window) => {
                if state.debouncing {
                    return;
                }
                state.debouncing = true;
                let line = Arc::downgrade(self);
                self.timers.schedule(
                    window,
                    Box::new(move || {
                        if let Some(line) = line.upgrade() {
                            line.debounce_elapsed();
                        }
                    }),
                );
            }
        }
    }

    fn debounce_elapsed(&self) {
        let mut state = self.state.lock();
        state.debouncing = false;
        if state.listeners.is_empty() {
            return;
        }

        // reading clears anything latched during the window
        if let Err(e) = read_value(&self.value) {
            warn!("gpio{} debounce read: {e}", self.id);
        }
        if let Err(e) = self.poller.modify(self.fd, Interest::PRIORITY_ONESHOT) {
            warn!("gpio{} re-arm: {e}", self.id);
        }
    }
}

impl Drop for LineInner {
    fn drop(&mut self) {
        if !self.state.get_mut().listeners.is_empty() {
            let _ = self.poller.remove(self.fd);
        }
    }
}

fn read_value(file: &File) -> Result<u8, GpioError> {
    let mut buf = [0u8; 1];
    let n = file
        .read_at(&mut buf, 0)
        .map_err(|e| GpioError::Io(format!("read value: {e}")))?;
    match (n, buf[0]) {
        (1, b'0') => Ok(0),
        (1, b'1') => Ok(1),
        (0, _) => Err(GpioError::Io("read value: empty value file".into())),
        (_, other) => Err(GpioError::Io(format!(
            "read value: unexpected byte {other:#04x}"
        ))),
    }
}

fn write_value(file: &File, value: u8) -> Result<(), GpioError> {
    let byte = if value == 1 { b"1" } else { b"0" };
    file.write_all_at(byte, 0)
        .map_err(|e| GpioError::Io(format!("write value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(persistent_watch: bool, debounce_timeout_ms: u64) -> WatchOptions {
        WatchOptions {
            persistent_watch,
            debounce_timeout_ms,
        }
    }

    #[test]
    fn policy_is_decided_from_options() {
        assert_eq!(WatchPolicy::from_options(&options(false, 0)), WatchPolicy::OneShot);
        // debounce only applies to persistent watches
        assert_eq!(WatchPolicy::from_options(&options(false, 30)), WatchPolicy::OneShot);
        assert_eq!(WatchPolicy::from_options(&options(true, 0)), WatchPolicy::Persistent);
        assert_eq!(
            WatchPolicy::from_options(&options(true, 30)),
            WatchPolicy::PersistentDebounced(Duration::from_millis(30))
        );
    }

    #[test]
    fn only_undebounced_persistent_watch_skips_oneshot() {
        assert_eq!(WatchPolicy::Persistent.interest(), Interest::PRIORITY);
        assert_eq!(WatchPolicy::OneShot.interest(), Interest::PRIORITY_ONESHOT);
        assert_eq!(
            WatchPolicy::PersistentDebounced(Duration::from_millis(1)).interest(),
            Interest::PRIORITY_ONESHOT
        );
    }

    #[test]
    fn value_is_a_single_ascii_digit() {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"1\n").unwrap();
        assert_eq!(read_value(&file), Ok(1));

        write_value(&file, 0).unwrap();
        assert_eq!(read_value(&file), Ok(0));

        file.set_len(0).unwrap();
        assert!(matches!(read_value(&file), Err(GpioError::Io(_))));
    }
}
