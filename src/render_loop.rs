//! Frame pacing state of one output.

use std::time::Duration;

use tracing::trace;

use crate::{
    error::FrameError,
    observer::{CallbackRef, Observers},
};

/// Refresh rate assumed when a display does not report one, in mHz.
pub const DEFAULT_REFRESH_RATE: u32 = 60_000;

/// Where frame completion notifications come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Page flip events of the device
    Hardware,
    /// A timer simulating vertical blanks
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Rendering,
    /// Submitted, waiting for the completion notification
    InFlight,
}

/// A frame became visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompleted {
    pub timestamp: Duration,
    /// Number of frames completed on this loop, including this one
    pub sequence: u64,
    pub refresh_interval: Duration,
}

/// Tracks the frame of one output through `Idle -> Rendering -> InFlight -> Idle`.
///
/// At most one frame is in flight at a time. A repaint requested while a frame is being rendered
/// or in flight is remembered and reported once the loop is idle again.
#[derive(Debug)]
pub struct RenderLoop {
    state: FrameState,
    repaint_pending: bool,
    inhibit_count: u32,
    refresh_rate: u32,
    pacing: PacingMode,
    last_presentation: Option<Duration>,
    completed_frames: u64,
    frame_completed: Observers<FrameCompleted>,
}

impl RenderLoop {
    pub fn new(refresh_rate: u32, pacing: PacingMode) -> Self {
        Self {
            state: FrameState::Idle,
            repaint_pending: false,
            inhibit_count: 0,
            refresh_rate: if refresh_rate == 0 {
                DEFAULT_REFRESH_RATE
            } else {
                refresh_rate
            },
            pacing,
            last_presentation: None,
            completed_frames: 0,
            frame_completed: Observers::new(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn pacing(&self) -> PacingMode {
        self.pacing
    }

    /// Refresh rate in mHz.
    pub fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    pub fn set_refresh_rate(&mut self, refresh_rate: u32) {
        if refresh_rate != 0 {
            self.refresh_rate = refresh_rate;
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000_000 / self.refresh_rate as u64)
    }

    pub fn last_presentation(&self) -> Option<Duration> {
        self.last_presentation
    }

    pub fn completed_frames(&self) -> u64 {
        self.completed_frames
    }

    /// Asks for a new frame. Returns whether one can be started right away.
    pub fn schedule_repaint(&mut self) -> bool {
        self.repaint_pending = true;
        self.can_begin_frame()
    }

    pub fn repaint_pending(&self) -> bool {
        self.repaint_pending
    }

    pub fn can_begin_frame(&self) -> bool {
        self.state == FrameState::Idle && self.inhibit_count == 0
    }

    pub fn begin_frame(&mut self) -> Result<(), FrameError> {
        if self.inhibit_count > 0 {
            return Err(FrameError::Inhibited);
        }
        if self.state != FrameState::Idle {
            return Err(FrameError::FrameInProgress);
        }
        self.state = FrameState::Rendering;
        self.repaint_pending = false;
        Ok(())
    }

    /// Finishes rendering. A frame that was not submitted returns the loop to idle.
    pub fn end_frame(&mut self, submitted: bool) -> Result<(), FrameError> {
        if self.state != FrameState::Rendering {
            return Err(FrameError::NoFrameStarted);
        }
        self.state = if submitted {
            FrameState::InFlight
        } else {
            FrameState::Idle
        };
        Ok(())
    }

    /// Handles the completion notification of the frame in flight.
    ///
    /// Notifications arriving while no frame is in flight are stale and ignored.
    pub fn notify_frame_completed(&mut self, timestamp: Duration) -> Option<FrameCompleted> {
        if self.state != FrameState::InFlight {
            trace!(state = ?self.state, "Ignoring stale frame completion");
            return None;
        }
        self.state = FrameState::Idle;
        self.last_presentation = Some(timestamp);
        self.completed_frames += 1;
        let event = FrameCompleted {
            timestamp,
            sequence: self.completed_frames,
            refresh_interval: self.refresh_interval(),
        };
        self.frame_completed.emit(&event);
        Some(event)
    }

    /// Drops the frame in progress, if any, and any pending repaint.
    ///
    /// Completion notifications for the dropped frame are ignored afterwards.
    pub fn invalidate(&mut self) {
        self.state = FrameState::Idle;
        self.repaint_pending = false;
    }

    pub fn inhibit(&mut self) {
        self.inhibit_count += 1;
    }

    pub fn uninhibit(&mut self) {
        self.inhibit_count = self.inhibit_count.saturating_sub(1);
    }

    pub fn on_frame_completed(&mut self, callback: impl FnMut(&FrameCompleted) + 'static) -> CallbackRef {
        self.frame_completed.register(callback)
    }

    pub fn forget_callback(&mut self, callback_ref: CallbackRef) -> bool {
        self.frame_completed.forget(callback_ref)
    }
}
