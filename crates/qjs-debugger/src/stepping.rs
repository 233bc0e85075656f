use tracing::trace;

use crate::location::Location;
use crate::protocol::StopReason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepMode {
    #[default]
    None,
    /// Step over: next line at the same or a shallower depth.
    Step,
    /// Next line boundary anywhere, including inside a new call.
    StepIn,
    /// First point after the anchor frame returns.
    StepOut,
    /// Run until the next breakpoint or exception.
    StepContinue,
}

/// Stepping state of one debug session.
///
/// The engine starts a mode when a resume command is accepted and asks
/// [`StepController::completion`] at every instrumentable point whether the
/// step is done.
#[derive(Debug, Clone, Default)]
pub struct StepController {
    mode: StepMode,
    anchor: Option<Location>,
    anchor_depth: usize,
    /// Line and depth the program was resumed from. Breakpoints there stay
    /// quiet until that frame moves to another line or returns.
    guard: Option<(Location, usize)>,
}

impl StepController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    pub fn anchor(&self) -> Option<&Location> {
        self.anchor.as_ref()
    }

    pub fn anchor_depth(&self) -> usize {
        self.anchor_depth
    }

    /// Begins a step from the stop at `anchor`/`depth`, replacing any
    /// previous mode.
    pub fn start(&mut self, mode: StepMode, anchor: Option<Location>, depth: usize) {
        trace!(?mode, ?anchor, depth, "Step started");
        if mode == StepMode::None {
            self.reset();
            return;
        }
        self.mode = mode;
        self.guard = anchor.clone().map(|loc| (loc, depth));
        if mode == StepMode::StepContinue {
            self.anchor = None;
            self.anchor_depth = 0;
        } else {
            self.anchor = anchor;
            self.anchor_depth = depth;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the engine has to resolve the current location even when no
    /// breakpoint bit is set.
    #[inline(always)]
    pub fn tracks_location(&self) -> bool {
        matches!(
            self.mode,
            StepMode::Step | StepMode::StepIn | StepMode::StepOut
        ) || self.guard.is_some()
    }

    /// Drops the resume guard once the resumed frame is on another line or
    /// has returned. Deeper frames leave it in place.
    pub fn observe(&mut self, loc: &Location, depth: usize) {
        let left = self.guard.as_ref().is_some_and(|(line, guard_depth)| {
            depth < *guard_depth || (depth == *guard_depth && !line.same_line(loc))
        });
        if left {
            self.guard = None;
        }
    }

    /// Whether a breakpoint at `loc`/`depth` is the one the program was just
    /// resumed from.
    pub fn suppresses_breakpoint(&self, loc: &Location, depth: usize) -> bool {
        self.guard
            .as_ref()
            .is_some_and(|(line, guard_depth)| depth == *guard_depth && line.same_line(loc))
    }

    pub fn is_complete(&self, loc: &Location, depth: usize) -> bool {
        let left_anchor_line = self
            .anchor
            .as_ref()
            .is_none_or(|anchor| !anchor.same_line(loc));

        match self.mode {
            StepMode::None | StepMode::StepContinue => false,
            StepMode::Step => depth <= self.anchor_depth && left_anchor_line,
            // A recursive call re-entering the anchor line is still a new stop.
            StepMode::StepIn => left_anchor_line || depth != self.anchor_depth,
            StepMode::StepOut => depth < self.anchor_depth,
        }
    }

    /// The stop reason if the active step completes at `loc`/`depth`.
    pub fn completion(&self, loc: &Location, depth: usize) -> Option<StopReason> {
        if !self.is_complete(loc, depth) {
            return None;
        }
        match self.mode {
            StepMode::Step => Some(StopReason::Step),
            StepMode::StepIn => Some(StopReason::StepIn),
            StepMode::StepOut => Some(StopReason::StepOut),
            StepMode::None | StepMode::StepContinue => None,
        }
    }
}
