use std::mem;

/// Cell pixel width used when the real font metrics are unknown.
const PIXELS_PER_COLUMN: u16 = 3;
/// Cell pixel height used when the real font metrics are unknown.
const PIXELS_PER_ROW: u16 = 5;

/// Fallback viewport used when the host console cannot be queried.
pub const DEFAULT_COLUMNS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 25;

/// Dimensions pushed to the PTY with `TIOCSWINSZ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Build a size with the heuristic pixel fields (columns x3, rows x5).
    pub fn from_cells(columns: u16, rows: u16) -> Self {
        Self {
            columns,
            rows,
            pixel_width: columns.saturating_mul(PIXELS_PER_COLUMN),
            pixel_height: rows.saturating_mul(PIXELS_PER_ROW),
        }
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        // SAFETY: libc::winsize is a plain C struct; zeroed is a valid baseline.
        let mut ws: libc::winsize = unsafe { mem::zeroed() };
        ws.ws_col = self.columns;
        ws.ws_row = self.rows;
        ws.ws_xpixel = self.pixel_width;
        ws.ws_ypixel = self.pixel_height;
        ws
    }

    pub(crate) fn from_winsize(ws: &libc::winsize) -> Self {
        Self {
            columns: ws.ws_col,
            rows: ws.ws_row,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::from_cells(DEFAULT_COLUMNS, DEFAULT_ROWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_fields_follow_cell_heuristic() {
        let size = WindowSize::from_cells(120, 40);
        assert_eq!(size.pixel_width, 360);
        assert_eq!(size.pixel_height, 200);
    }

    #[test]
    fn winsize_conversion_keeps_all_fields() {
        let size = WindowSize::from_cells(132, 43);
        assert_eq!(WindowSize::from_winsize(&size.to_winsize()), size);
    }

    #[test]
    fn default_matches_console_fallback() {
        let size = WindowSize::default();
        assert_eq!((size.columns, size.rows), (80, 25));
    }
}
