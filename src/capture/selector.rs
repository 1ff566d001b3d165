//! Interactive region selection
//!
//! [`Selector`] is the drag state machine, free of any rendering:
//!
//! ```text
//! Idle --button 1 down--> Dragging --button 1 up, area > 0--> Selected
//!                            |      --button 1 up, area = 0--> Cancelled
//!  any state --Escape / window closed--> Cancelled
//! ```
//!
//! Terminal states are sticky. [`run_selection`] pumps events from a
//! [`SelectionSurface`] (the X11 overlay in production) into a fresh
//! selector until it terminates.

use crate::{
    error::CaptureResult,
    model::{Region, normalize_drag},
};

/// Primary pointer button
pub const PRIMARY_BUTTON: u8 = 1;

/// Input delivered by a selection surface, in surface coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionEvent {
    PointerDown { x: i32, y: i32, button: u8 },
    PointerMotion { x: i32, y: i32 },
    PointerUp { x: i32, y: i32, button: u8 },
    /// The cancel key (Escape) was pressed
    CancelKey,
    /// The surface was closed or destroyed
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Idle,
    Dragging { anchor: (i32, i32), current: (i32, i32) },
    Selected(Region),
    Cancelled,
}

/// Drag-to-select state machine
#[derive(Debug, Clone)]
pub struct Selector {
    state: SelectorState,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self {
            state: SelectorState::Idle,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// Whether the selector reached `Selected` or `Cancelled`
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SelectorState::Selected(_) | SelectorState::Cancelled)
    }

    /// Final result: `Some(Some(region))`, `Some(None)` when cancelled, or
    /// `None` while still running
    pub fn outcome(&self) -> Option<Option<Region>> {
        match self.state {
            SelectorState::Selected(region) => Some(Some(region)),
            SelectorState::Cancelled => Some(None),
            _ => None,
        }
    }

    /// Normalized rectangle being dragged, possibly zero-sized
    pub fn current_rect(&self) -> Option<(i32, i32, u32, u32)> {
        match self.state {
            SelectorState::Dragging { anchor, current } => Some(normalize_drag(anchor, current)),
            _ => None,
        }
    }

    /// Feeds one event; returns whether the surface needs a redraw
    pub fn handle(&mut self, event: SelectionEvent) -> bool {
        if self.is_finished() {
            return false;
        }

        let next = match (self.state, event) {
            (_, SelectionEvent::CancelKey | SelectionEvent::Closed) => SelectorState::Cancelled,
            (
                SelectorState::Idle,
                SelectionEvent::PointerDown {
                    x,
                    y,
                    button: PRIMARY_BUTTON,
                },
            ) => SelectorState::Dragging {
                anchor:  (x, y),
                current: (x, y),
            },
            (SelectorState::Dragging { anchor, .. }, SelectionEvent::PointerMotion { x, y }) => {
                SelectorState::Dragging {
                    anchor,
                    current: (x, y),
                }
            }
            (
                SelectorState::Dragging { anchor, .. },
                SelectionEvent::PointerUp {
                    x,
                    y,
                    button: PRIMARY_BUTTON,
                },
            ) => match Region::from_corners(anchor, (x, y)) {
                Some(region) => SelectorState::Selected(region),
                None => SelectorState::Cancelled,
            },
            // Pointer-up while idle, other buttons, motion while idle
            (state, _) => state,
        };

        let changed = next != self.state;
        if changed {
            tracing::trace!("Selector {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        changed && matches!(self.state, SelectorState::Dragging { .. })
    }
}

/// A full-screen surface that shows the snapshot and reports input
pub trait SelectionSurface {
    /// Blocks until the next relevant input event
    fn next_event(&mut self) -> CaptureResult<SelectionEvent>;

    /// Redraws the dimmed snapshot with `selection` (normalized
    /// `left, top, width, height`) shown undimmed, or nothing selected
    fn draw(&mut self, selection: Option<(i32, i32, u32, u32)>) -> CaptureResult<()>;
}

/// Runs a fresh [`Selector`] against `surface` until it terminates
///
/// Returns the selected region in surface coordinates, or `None` when the
/// user cancelled or released without dragging.
///
/// # Errors
///
/// Propagates surface failures; the selection is abandoned.
pub fn run_selection(surface: &mut dyn SelectionSurface) -> CaptureResult<Option<Region>> {
    let mut selector = Selector::new();
    surface.draw(None)?;

    loop {
        let event = surface.next_event()?;
        if selector.handle(event) {
            surface.draw(selector.current_rect())?;
        }

        if let Some(outcome) = selector.outcome() {
            tracing::debug!("Selection finished: {:?}", outcome);
            return Ok(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::ScriptedSurface;

    fn down(x: i32, y: i32) -> SelectionEvent {
        SelectionEvent::PointerDown {
            x,
            y,
            button: PRIMARY_BUTTON,
        }
    }

    fn up(x: i32, y: i32) -> SelectionEvent {
        SelectionEvent::PointerUp {
            x,
            y,
            button: PRIMARY_BUTTON,
        }
    }

    fn motion(x: i32, y: i32) -> SelectionEvent {
        SelectionEvent::PointerMotion { x, y }
    }

    #[test]
    fn test_drag_selects_normalized_region() {
        let mut selector = Selector::new();
        selector.handle(down(50, 50));
        selector.handle(motion(30, 30));
        selector.handle(up(10, 10));

        let region = selector.outcome().unwrap().unwrap();
        assert_eq!(region.as_tuple(), (10, 10, 40, 40));
    }

    #[test]
    fn test_zero_width_drag_cancels() {
        let mut selector = Selector::new();
        selector.handle(down(10, 10));
        selector.handle(up(10, 90));
        assert_eq!(selector.state(), SelectorState::Cancelled);
        assert_eq!(selector.outcome(), Some(None));
    }

    #[test]
    fn test_pointer_up_while_idle_is_ignored() {
        let mut selector = Selector::new();
        assert!(!selector.handle(up(10, 10)));
        assert_eq!(selector.state(), SelectorState::Idle);
        assert!(selector.outcome().is_none());
    }

    #[test]
    fn test_escape_cancels_from_any_state() {
        let mut selector = Selector::new();
        selector.handle(SelectionEvent::CancelKey);
        assert_eq!(selector.state(), SelectorState::Cancelled);

        let mut selector = Selector::new();
        selector.handle(down(1, 1));
        selector.handle(motion(20, 20));
        selector.handle(SelectionEvent::Closed);
        assert_eq!(selector.state(), SelectorState::Cancelled);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut selector = Selector::new();
        selector.handle(down(0, 0));
        selector.handle(up(10, 10));
        let selected = selector.state();

        selector.handle(SelectionEvent::CancelKey);
        selector.handle(down(5, 5));
        assert_eq!(selector.state(), selected);

        let mut selector = Selector::new();
        selector.handle(SelectionEvent::Closed);
        selector.handle(down(0, 0));
        selector.handle(up(10, 10));
        assert_eq!(selector.state(), SelectorState::Cancelled);
    }

    #[test]
    fn test_secondary_button_is_ignored() {
        let mut selector = Selector::new();
        selector.handle(SelectionEvent::PointerDown {
            x:      0,
            y:      0,
            button: 3,
        });
        assert_eq!(selector.state(), SelectorState::Idle);

        selector.handle(down(0, 0));
        selector.handle(SelectionEvent::PointerUp {
            x:      10,
            y:      10,
            button: 3,
        });
        assert!(matches!(selector.state(), SelectorState::Dragging { .. }));
    }

    #[test]
    fn test_motion_requests_redraw_only_while_dragging() {
        let mut selector = Selector::new();
        assert!(!selector.handle(motion(5, 5)));
        assert!(selector.handle(down(5, 5)));
        assert!(selector.handle(motion(15, 25)));
        assert_eq!(selector.current_rect(), Some((5, 5, 10, 20)));
    }

    #[test]
    fn test_run_selection_draws_and_returns_region() {
        let mut surface =
            ScriptedSurface::new(vec![motion(1, 1), down(100, 100), motion(200, 150), up(300, 400)]);

        let region = run_selection(&mut surface).unwrap().unwrap();
        assert_eq!(region.as_tuple(), (100, 100, 200, 300));

        let draws = surface.draws();
        assert_eq!(draws.first(), Some(&None));
        assert_eq!(draws.last(), Some(&Some((100, 100, 100, 50))));
    }

    #[test]
    fn test_run_selection_cancelled() {
        let mut surface = ScriptedSurface::new(vec![down(100, 100), SelectionEvent::CancelKey]);
        assert_eq!(run_selection(&mut surface).unwrap(), None);
    }

    #[test]
    fn test_run_selection_surface_error_propagates() {
        // Script runs dry before the selector terminates
        let mut surface = ScriptedSurface::new(vec![down(1, 1)]);
        assert!(run_selection(&mut surface).is_err());
    }
}
