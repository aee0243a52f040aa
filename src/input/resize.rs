use tracing::{debug, warn};

use super::InputBatcher;
use crate::pty_session::{PtyInput, WindowSize};

/// Source of the host console's current viewport.
pub trait Viewport {
    /// Current `(columns, rows)`, given the dimensions carried by the event.
    fn query(&self, reported: (u16, u16)) -> Option<(u16, u16)>;
}

impl<V: Viewport + ?Sized> Viewport for Box<V> {
    fn query(&self, reported: (u16, u16)) -> Option<(u16, u16)> {
        (**self).query(reported)
    }
}

/// The bridge's own terminal, falling back to the reported size.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostViewport;

impl Viewport for HostViewport {
    fn query(&self, reported: (u16, u16)) -> Option<(u16, u16)> {
        match crossterm::terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => Some((cols, rows)),
            Ok(_) => nonzero(reported),
            Err(err) => {
                debug!("terminal size query failed: {err}");
                nonzero(reported)
            }
        }
    }
}

/// Trusts the dimensions delivered with the event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportedViewport;

impl Viewport for ReportedViewport {
    fn query(&self, reported: (u16, u16)) -> Option<(u16, u16)> {
        nonzero(reported)
    }
}

fn nonzero((cols, rows): (u16, u16)) -> Option<(u16, u16)> {
    (cols > 0 && rows > 0).then_some((cols, rows))
}

/// Outcome of one viewport change that produced a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedResize {
    pub size: WindowSize,
    /// Whether `TIOCSWINSZ` succeeded on every open master.
    pub applied: bool,
}

/// Turns viewport changes into `TIOCSWINSZ` updates on every PTY master.
#[derive(Debug)]
pub struct ResizePropagator<V: Viewport = HostViewport> {
    viewport: V,
}

impl<V: Viewport> ResizePropagator<V> {
    pub fn new(viewport: V) -> Self {
        Self { viewport }
    }

    /// Current viewport as a window size, if it can be determined.
    pub fn current(&self, reported: (u16, u16)) -> Option<WindowSize> {
        self.viewport
            .query(reported)
            .map(|(cols, rows)| WindowSize::from_cells(cols, rows))
    }

    /// Flush pending keystrokes, then resize.
    ///
    /// `None` means the viewport could not be determined and nothing was sent.
    /// A failed ioctl is logged and leaves the PTY at its previous dimensions.
    pub fn on_viewport_changed(
        &self,
        reported: (u16, u16),
        batcher: &mut InputBatcher,
        target: &mut dyn PtyInput,
    ) -> Option<AppliedResize> {
        let Some(size) = self.current(reported) else {
            warn!(?reported, "viewport query failed, keeping pty size");
            return None;
        };
        if let Err(err) = batcher.flush(target) {
            warn!("input flush before resize failed: {err}");
        }
        let applied = match target.set_window_size(size) {
            Ok(()) => {
                debug!(columns = size.columns, rows = size.rows, "pty resized");
                true
            }
            Err(err) => {
                warn!(columns = size.columns, rows = size.rows, "TIOCSWINSZ failed: {err}");
                false
            }
        };
        Some(AppliedResize { size, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::batcher::tests::RecordingPty;

    struct FixedViewport(Option<(u16, u16)>);

    impl Viewport for FixedViewport {
        fn query(&self, _reported: (u16, u16)) -> Option<(u16, u16)> {
            self.0
        }
    }

    #[test]
    fn resize_uses_reported_dimensions_and_pixel_heuristic() {
        let mut pty = RecordingPty::default();
        let mut batcher = InputBatcher::new();
        let propagator = ResizePropagator::new(ReportedViewport);
        let applied = propagator.on_viewport_changed((120, 40), &mut batcher, &mut pty);
        let expected = WindowSize {
            columns: 120,
            rows: 40,
            pixel_width: 360,
            pixel_height: 200,
        };
        assert_eq!(
            applied,
            Some(AppliedResize {
                size: expected,
                applied: true
            })
        );
        assert_eq!(pty.resizes, vec![expected]);
    }

    #[test]
    fn failed_ioctl_is_reported_with_the_attempted_size() {
        let mut pty = RecordingPty {
            fail_resizes: true,
            ..RecordingPty::default()
        };
        let mut batcher = InputBatcher::new();
        let propagator = ResizePropagator::new(ReportedViewport);
        let outcome = propagator
            .on_viewport_changed((100, 30), &mut batcher, &mut pty)
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.size, WindowSize::from_cells(100, 30));
    }

    #[test]
    fn pending_input_is_flushed_before_resize() {
        let mut pty = RecordingPty::default();
        let mut batcher = InputBatcher::new();
        batcher.append(&mut pty, b"echo").unwrap();
        assert!(pty.calls.is_empty());
        let propagator = ResizePropagator::new(FixedViewport(Some((90, 30))));
        propagator.on_viewport_changed((0, 0), &mut batcher, &mut pty);
        assert_eq!(pty.calls, vec!["write", "resize"]);
        assert_eq!(pty.writes, vec![b"echo".to_vec()]);
    }

    #[test]
    fn failed_query_leaves_pty_untouched() {
        let mut pty = RecordingPty::default();
        let mut batcher = InputBatcher::new();
        batcher.append(&mut pty, b"x").unwrap();
        let propagator = ResizePropagator::new(FixedViewport(None));
        assert_eq!(propagator.on_viewport_changed((0, 0), &mut batcher, &mut pty), None);
        assert!(pty.calls.is_empty());
        assert_eq!(batcher.pending(), b"x");
    }

    #[test]
    fn reported_viewport_rejects_zero_dimensions() {
        assert_eq!(ReportedViewport.query((0, 40)), None);
        assert_eq!(ReportedViewport.query((80, 24)), Some((80, 24)));
    }
}
