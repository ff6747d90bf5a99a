//! Vsync source
//!
//! [`HwcVsync`] delivers a periodic vsync notification to one [`VsyncObserver`]. The ticks are
//! either the vblanks of a crtc (hardware mode) or synthesized from the monotonic clock
//! (software mode). In both modes they are delivered from a dedicated thread, one tick at a
//! time.
//!
//! If a crtc stops delivering vblanks for three periods, a software tick is delivered in place
//! of the missing vblank.
//!
//! Once [`HwcVsync::set_enabled`]`(false)` returned, no further tick is delivered. Disabling
//! from another thread therefore waits for a tick that is being delivered right now. Disabling
//! from within [`VsyncObserver::on_vsync`] does not wait, the running callback is the last one.
//!
//! The observer can be a [`calloop::channel::Sender`], so ticks can be handled inside an event
//! loop:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use hwcomposer::vsync::HwcVsync;
//!
//! let (sender, channel) = calloop::channel::channel();
//! let mut event_loop = calloop::EventLoop::<()>::try_new().unwrap();
//! event_loop
//!     .handle()
//!     .insert_source(channel, |event, _, _| {
//!         if let calloop::channel::Event::Msg(timestamp) = event {
//!             println!("vsync at {:?}", timestamp);
//!         }
//!     })
//!     .unwrap();
//!
//! let vsync = HwcVsync::new(Duration::from_micros(16_667))?;
//! vsync.set_observer(Arc::new(sender));
//! vsync.set_enabled(true);
//! # Ok::<(), hwcomposer::Error>(())
//! ```

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    hw::HwDisplayCrtc,
    utils::{Clock, Monotonic, Time},
};

/// Receiver of vsync ticks
pub trait VsyncObserver: Send + Sync {
    /// Called on the vsync thread for every tick
    fn on_vsync(&self, timestamp: Time<Monotonic>);
}

impl VsyncObserver for calloop::channel::Sender<Time<Monotonic>> {
    fn on_vsync(&self, timestamp: Time<Monotonic>) {
        // the receiving event loop may already be gone
        let _ = self.send(timestamp);
    }
}

#[derive(Debug, Clone)]
enum VsyncSource {
    Software,
    Hardware(Arc<HwDisplayCrtc>),
}

struct VsyncState {
    source: VsyncSource,
    enabled: bool,
    exit: bool,
    period: Duration,
    prev: Option<Time<Monotonic>>,
    observer: Option<Arc<dyn VsyncObserver>>,
    in_callback: bool,
    // bumped whenever a pending tick becomes stale
    generation: u64,
}

struct Shared {
    state: Mutex<VsyncState>,
    cond: Condvar,
}

/// Hardware or software driven vsync source
pub struct HwcVsync {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl std::fmt::Debug for HwcVsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("HwcVsync")
            .field("source", &state.source)
            .field("enabled", &state.enabled)
            .field("period", &state.period)
            .finish_non_exhaustive()
    }
}

impl HwcVsync {
    /// Starts a disabled software vsync source ticking every `period`
    pub fn new(period: Duration) -> Result<HwcVsync> {
        let shared = Arc::new(Shared {
            state: Mutex::new(VsyncState {
                source: VsyncSource::Software,
                enabled: false,
                exit: false,
                period: if period.is_zero() {
                    crate::config::DEFAULT_VSYNC_PERIOD
                } else {
                    period
                },
                prev: None,
                observer: None,
                in_callback: false,
                generation: 0,
            }),
            cond: Condvar::new(),
        });

        let thread = thread::Builder::new()
            .name("hwc-vsync".into())
            .spawn({
                let shared = shared.clone();
                move || vsync_loop(&shared)
            })
            .map_err(|source| Error::Access {
                errmsg: "Failed to spawn vsync thread",
                source,
            })?;

        Ok(HwcVsync {
            shared,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Registers the receiver of the ticks, replacing the previous one
    pub fn set_observer(&self, observer: Arc<dyn VsyncObserver>) {
        self.shared.state.lock().unwrap().observer = Some(observer);
    }

    /// Uses the vblanks of `crtc` as ticks
    pub fn set_hw_mode(&self, crtc: Arc<HwDisplayCrtc>) {
        debug!(crtc = crtc.id(), "Switching to hardware vsync");
        self.set_source(VsyncSource::Hardware(crtc));
    }

    /// Synthesizes the ticks from the monotonic clock
    pub fn set_software_mode(&self) {
        debug!("Switching to software vsync");
        self.set_source(VsyncSource::Software);
    }

    /// Returns whether the ticks come from a crtc
    pub fn is_hardware_mode(&self) -> bool {
        matches!(self.shared.state.lock().unwrap().source, VsyncSource::Hardware(_))
    }

    fn set_source(&self, source: VsyncSource) {
        let state = self.shared.state.lock().unwrap();
        let enabled = state.enabled;
        let mut state = self.disable_locked(state);
        state.source = source;
        state.prev = None;
        state.enabled = enabled;
        self.shared.cond.notify_all();
    }

    /// Starts or stops delivering ticks
    ///
    /// Enabling without an observer is a programming error.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if state.enabled == enabled {
            return;
        }

        if enabled {
            if state.observer.is_none() {
                debug_assert!(false, "vsync enabled without observer");
                warn!("Vsync enabled without observer, ignoring");
                return;
            }
            trace!("Vsync enabled");
            state.enabled = true;
            self.shared.cond.notify_all();
        } else {
            trace!("Vsync disabled");
            drop(self.disable_locked(state));
        }
    }

    // Disables delivery, on return no callback is running unless called from one
    fn disable_locked<'a>(&'a self, mut state: MutexGuard<'a, VsyncState>) -> MutexGuard<'a, VsyncState> {
        state.enabled = false;
        state.generation = state.generation.wrapping_add(1);
        self.shared.cond.notify_all();

        if thread::current().id() != self.thread_id {
            while state.in_callback {
                state = self.shared.cond.wait(state).unwrap();
            }
        }
        state
    }

    /// Returns whether ticks are delivered
    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().unwrap().enabled
    }

    /// Changes the software tick period, from the next tick on
    ///
    /// A zero period is ignored.
    pub fn set_period(&self, period: Duration) {
        if period.is_zero() {
            warn!("Ignoring zero vsync period");
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.period = period;
        self.shared.cond.notify_all();
    }

    /// Current tick period
    pub fn period(&self) -> Duration {
        self.shared.state.lock().unwrap().period
    }
}

impl Drop for HwcVsync {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.exit = true;
            state.enabled = false;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
    }
}

// First tick of the period grid anchored at `prev` that lies after `now`
fn next_deadline(prev: Option<Time<Monotonic>>, now: Time<Monotonic>, period: Duration) -> Time<Monotonic> {
    match prev {
        None => now.saturating_add(period),
        Some(prev) => {
            let elapsed = prev.duration_since(now).as_nanos();
            let missed = elapsed / period.as_nanos();
            let ahead = period.as_nanos() * (missed + 1);
            prev.saturating_add(Duration::from_nanos(ahead.min(u64::MAX as u128) as u64))
        }
    }
}

fn vsync_loop(shared: &Shared) {
    let clock = Clock::<Monotonic>::new();
    let mut state = shared.state.lock().unwrap();

    loop {
        while !state.enabled && !state.exit {
            state = shared.cond.wait(state).unwrap();
        }
        if state.exit {
            break;
        }

        let generation = state.generation;
        let timestamp = match state.source.clone() {
            VsyncSource::Software => {
                let now = clock.now();
                let deadline = next_deadline(state.prev, now, state.period);
                state = shared
                    .cond
                    .wait_timeout(state, now.duration_since(deadline))
                    .unwrap()
                    .0;
                if clock.now() < deadline {
                    // woken up early, recheck everything
                    continue;
                }
                deadline
            }
            VsyncSource::Hardware(crtc) => {
                let period = state.period;
                drop(state);
                let vblank = crtc.wait_vblank(period * 3);
                state = shared.state.lock().unwrap();
                match vblank {
                    Ok(Some(timestamp)) => timestamp,
                    Ok(None) => {
                        debug!(crtc = crtc.id(), "No vblank for three periods, synthesizing vsync");
                        clock.now()
                    }
                    Err(err) => {
                        warn!(crtc = crtc.id(), "Waiting for vblank failed: {}", err);
                        state = shared.cond.wait_timeout(state, period).unwrap().0;
                        continue;
                    }
                }
            }
        };

        if !state.enabled || state.exit || state.generation != generation {
            continue;
        }
        state.prev = Some(timestamp);
        let Some(observer) = state.observer.clone() else {
            continue;
        };

        state.in_callback = true;
        drop(state);
        observer.on_vsync(timestamp);
        state = shared.state.lock().unwrap();
        state.in_callback = false;
        shared.cond.notify_all();
    }
}
