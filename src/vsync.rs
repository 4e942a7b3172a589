//! Simulated vertical blanks for presenters without completion events.

use std::{cell::Cell, rc::Rc, time::{Duration, Instant}};

use calloop::{
    timer::{TimeoutAction, Timer},
    LoopHandle, RegistrationToken,
};
use tracing::{trace, warn};

use crate::render_loop::DEFAULT_REFRESH_RATE;

/// Fires a callback at the next multiple of the refresh interval after being armed.
///
/// Arming an armed monitor does nothing, so at most one simulated vblank is pending at a time.
pub struct SoftwareVsyncMonitor<D: 'static> {
    handle: LoopHandle<'static, D>,
    refresh_rate: u32,
    origin: Instant,
    last_vblank: Rc<Cell<Duration>>,
    pending: Rc<Cell<Option<RegistrationToken>>>,
    on_vblank: Rc<dyn Fn(&mut D, Duration)>,
}

impl<D: 'static> std::fmt::Debug for SoftwareVsyncMonitor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareVsyncMonitor")
            .field("refresh_rate", &self.refresh_rate)
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl<D: 'static> SoftwareVsyncMonitor<D> {
    pub fn new(
        handle: LoopHandle<'static, D>,
        refresh_rate: u32,
        on_vblank: impl Fn(&mut D, Duration) + 'static,
    ) -> Self {
        Self {
            handle,
            refresh_rate: if refresh_rate == 0 {
                DEFAULT_REFRESH_RATE
            } else {
                refresh_rate
            },
            origin: Instant::now(),
            last_vblank: Rc::new(Cell::new(Duration::ZERO)),
            pending: Rc::new(Cell::new(None)),
            on_vblank: Rc::new(on_vblank),
        }
    }

    pub fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    /// Changes the refresh rate. A pending vblank is moved onto the new interval.
    pub fn set_refresh_rate(&mut self, refresh_rate: u32) {
        if refresh_rate == 0 || refresh_rate == self.refresh_rate {
            return;
        }
        self.refresh_rate = refresh_rate;
        if self.is_armed() {
            self.disarm();
            self.arm();
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000_000 / self.refresh_rate as u64)
    }

    pub fn is_armed(&self) -> bool {
        self.pending.get().is_some()
    }

    /// Schedules the next simulated vblank.
    pub fn arm(&mut self) {
        if self.is_armed() {
            return;
        }

        let now = self.origin.elapsed();
        let next = next_vblank(self.last_vblank.get(), now, self.interval());
        let last_vblank = self.last_vblank.clone();
        let pending = self.pending.clone();
        let on_vblank = self.on_vblank.clone();

        trace!(delay = ?(next - now), "arming software vsync");
        let token = self.handle.insert_source(
            Timer::from_duration(next - now),
            move |_, _, data| {
                pending.set(None);
                last_vblank.set(next);
                on_vblank(data, next);
                TimeoutAction::Drop
            },
        );
        match token {
            Ok(token) => self.pending.set(Some(token)),
            Err(err) => warn!("Failed to schedule software vsync: {}", err.error),
        }
    }

    /// Cancels the pending simulated vblank, if any.
    pub fn disarm(&mut self) {
        if let Some(token) = self.pending.take() {
            self.handle.remove(token);
        }
    }
}

impl<D: 'static> Drop for SoftwareVsyncMonitor<D> {
    fn drop(&mut self) {
        if let Some(token) = self.pending.take() {
            self.handle.remove(token);
        }
    }
}

/// The first vblank after `now` on the grid `last + k * interval`.
fn next_vblank(last: Duration, now: Duration, interval: Duration) -> Duration {
    if interval.is_zero() || now < last {
        return last + interval;
    }
    let elapsed = (now - last).as_nanos();
    let periods = elapsed / interval.as_nanos() + 1;
    last + Duration::from_nanos((periods * interval.as_nanos()) as u64)
}
