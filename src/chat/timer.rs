//! Keep-alive timer - deadline-driven task with pause/resume/reset
//!
//! A background task scans the state at a fixed cadence and reports
//! progress on an event channel. All mutations serialize on one lock;
//! events are sent after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Scan cadence of the background task
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    Paused,
}

/// Events emitted by the timer
#[derive(Debug, Clone)]
pub enum TimerEvent {
    Started,
    Tick { elapsed: Duration },
    Completed,
    Paused,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TimerError {
    #[error("Timer has been disposed")]
    Disposed,

    #[error("Timer interval is not configured")]
    NotConfigured,
}

struct TimerInner {
    state: TimerState,
    interval: Duration,
    repeat: bool,
    started_at: Option<Instant>,
    /// Elapsed accumulated up to the pause point
    accumulated: Duration,
    disposed: bool,
}

impl TimerInner {
    fn elapsed(&self, now: Instant) -> Duration {
        match self.state {
            TimerState::Running => self
                .started_at
                .map(|s| now.duration_since(s))
                .unwrap_or_default(),
            TimerState::Paused => self.accumulated,
            TimerState::Stopped => Duration::ZERO,
        }
    }
}

/// Periodic timer driving keep-alive pings
pub struct KeepAliveTimer {
    inner: Arc<Mutex<TimerInner>>,
    event_tx: mpsc::UnboundedSender<TimerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<TimerEvent>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl KeepAliveTimer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                state: TimerState::Stopped,
                interval: Duration::ZERO,
                repeat: false,
                started_at: None,
                accumulated: Duration::ZERO,
                disposed: false,
            })),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TimerEvent>> {
        self.event_rx.take()
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn guard_disposed(inner: &TimerInner) -> Result<(), TimerError> {
        if inner.disposed {
            Err(TimerError::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> TimerState {
        self.lock().state
    }

    pub fn set_interval(&self, interval: Duration, repeat: bool) -> Result<(), TimerError> {
        let mut inner = self.lock();
        Self::guard_disposed(&inner)?;
        inner.interval = interval;
        inner.repeat = repeat;
        Ok(())
    }

    /// Start from stopped (zero elapsed) or resume from paused (elapsed kept)
    pub fn start(&self) -> Result<(), TimerError> {
        let event = {
            let mut inner = self.lock();
            Self::guard_disposed(&inner)?;
            if inner.interval.is_zero() {
                return Err(TimerError::NotConfigured);
            }
            let now = Instant::now();
            match inner.state {
                TimerState::Stopped => {
                    inner.accumulated = Duration::ZERO;
                    inner.started_at = Some(now);
                    inner.state = TimerState::Running;
                    Some(TimerEvent::Started)
                }
                TimerState::Paused => {
                    // Shift the start point so accumulated elapsed survives
                    inner.started_at = Some(now - inner.accumulated);
                    inner.accumulated = Duration::ZERO;
                    inner.state = TimerState::Running;
                    Some(TimerEvent::Started)
                }
                TimerState::Running => None,
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
            self.spawn_scan_task();
        }
        Ok(())
    }

    /// Re-start while paused
    pub fn resume(&self) -> Result<(), TimerError> {
        self.start()
    }

    pub fn pause(&self) -> Result<(), TimerError> {
        let event = {
            let mut inner = self.lock();
            Self::guard_disposed(&inner)?;
            if inner.state != TimerState::Running {
                return Ok(());
            }
            let now = Instant::now();
            inner.accumulated = inner.elapsed(now);
            inner.started_at = None;
            inner.state = TimerState::Paused;
            TimerEvent::Paused
        };
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Zero the elapsed time. Running stays running; paused transitions to
    /// stopped; stopped is a no-op.
    pub fn reset(&self) -> Result<(), TimerError> {
        let event = {
            let mut inner = self.lock();
            Self::guard_disposed(&inner)?;
            match inner.state {
                TimerState::Running => {
                    inner.started_at = Some(Instant::now());
                    inner.accumulated = Duration::ZERO;
                    None
                }
                TimerState::Paused => {
                    inner.state = TimerState::Stopped;
                    inner.started_at = None;
                    inner.accumulated = Duration::ZERO;
                    Some(TimerEvent::Stopped)
                }
                TimerState::Stopped => None,
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
        Ok(())
    }

    /// Idempotent; safe even after dispose
    pub fn stop(&self) {
        let event = {
            let mut inner = self.lock();
            if inner.state == TimerState::Stopped {
                None
            } else {
                inner.state = TimerState::Stopped;
                inner.started_at = None;
                inner.accumulated = Duration::ZERO;
                Some(TimerEvent::Stopped)
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    /// Time left until the next completion
    pub fn remaining(&self) -> Result<Duration, TimerError> {
        let inner = self.lock();
        Self::guard_disposed(&inner)?;
        Ok(inner.interval.saturating_sub(inner.elapsed(Instant::now())))
    }

    /// Tear down the timer; every later call except `stop` fails
    pub fn dispose(&self) {
        {
            let mut inner = self.lock();
            inner.disposed = true;
            inner.state = TimerState::Stopped;
            inner.started_at = None;
            inner.accumulated = Duration::ZERO;
        }
        let shutdown = match self.shutdown_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = shutdown {
            let _ = tx.try_send(());
        }
    }

    fn spawn_scan_task(&self) {
        let mut slot = match self.shutdown_tx.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *slot = Some(shutdown_tx);

        let inner = self.inner.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                let (events, disposed) = {
                    let mut inner = match inner.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    (scan(&mut inner), inner.disposed)
                };
                for event in events {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                if disposed {
                    break;
                }
            }
        });
    }
}

impl Default for KeepAliveTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeepAliveTimer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// One scan step; runs under the state lock, returns events to send after
fn scan(inner: &mut TimerInner) -> Vec<TimerEvent> {
    let mut events = Vec::new();
    if inner.disposed || inner.state != TimerState::Running {
        return events;
    }
    let now = Instant::now();
    let elapsed = inner.elapsed(now);
    events.push(TimerEvent::Tick { elapsed });
    if inner.interval.is_zero() {
        events.push(TimerEvent::Error("timer running with zero interval".to_string()));
        inner.state = TimerState::Stopped;
        inner.started_at = None;
        return events;
    }
    if elapsed >= inner.interval {
        if inner.repeat {
            inner.started_at = Some(now);
        } else {
            inner.state = TimerState::Stopped;
            inner.started_at = None;
            inner.accumulated = Duration::ZERO;
        }
        events.push(TimerEvent::Completed);
    }
    events
}
