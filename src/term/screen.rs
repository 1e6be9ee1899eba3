//! In-memory VT screen emulation.
//!
//! [`Screen`] consumes the raw byte stream coming off a PTY master and
//! maintains a fixed-size character grid plus an unbounded scrollback of
//! lines that left the top. It is a deterministic function of the byte
//! stream and the initial geometry: assertions depend on that.
//!
//! The dialect is the subset terminals emit in practice: printable text with
//! deferred auto-wrap, C0 controls, CSI cursor movement and erasure, SGR
//! (consumed, attributes are irrelevant to assertion text), and the DECSET
//! alternate-screen modes. Unknown sequences are consumed and ignored rather
//! than leaking into the grid.

/// Parser state between bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
    Charset,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    row: usize,
    col: usize,
}

type Grid = Vec<Vec<char>>;

fn blank_row(cols: usize) -> Vec<char> {
    vec![' '; cols]
}

fn blank_grid(rows: usize, cols: usize) -> Grid {
    (0..rows).map(|_| blank_row(cols)).collect()
}

/// The emulated terminal screen.
pub struct Screen {
    rows: usize,
    cols: usize,
    primary: Grid,
    alt: Grid,
    scrollback: Vec<Vec<char>>,
    cursor: Cursor,
    saved_cursor: Cursor,
    alt_active: bool,
    pending_wrap: bool,

    state: State,
    params: Vec<u16>,
    current_param: u16,
    has_param: bool,
    private_marker: bool,
    utf8: Vec<u8>,
    utf8_remaining: usize,
}

impl Screen {
    pub fn new(rows: u16, cols: u16) -> Screen {
        let rows = rows.max(1) as usize;
        let cols = cols.max(1) as usize;
        Screen {
            rows,
            cols,
            primary: blank_grid(rows, cols),
            alt: blank_grid(rows, cols),
            scrollback: Vec::new(),
            cursor: Cursor::default(),
            saved_cursor: Cursor::default(),
            alt_active: false,
            pending_wrap: false,
            state: State::Ground,
            params: Vec::new(),
            current_param: 0,
            has_param: false,
            private_marker: false,
            utf8: Vec::new(),
            utf8_remaining: 0,
        }
    }

    /// Feeds PTY output into the emulator.
    pub fn advance(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.step(byte);
        }
    }

    /// The on-screen grid, row-major.
    pub fn viewable_buffer(&self) -> Vec<Vec<char>> {
        self.active_grid().clone()
    }

    /// Scrollback followed by the on-screen grid, row-major.
    pub fn buffer(&self) -> Vec<Vec<char>> {
        let mut out = self.scrollback.clone();
        out.extend(self.active_grid().iter().cloned());
        out
    }

    #[cfg(test)]
    pub(crate) fn cursor_position(&self) -> (usize, usize) {
        (self.cursor.row, self.cursor.col)
    }

    /// Resizes the grids, clamping the cursor into the new bounds.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1) as usize;
        let cols = cols.max(1) as usize;
        for grid in [&mut self.primary, &mut self.alt] {
            grid.resize_with(rows, || blank_row(cols));
            for row in grid.iter_mut() {
                row.resize(cols, ' ');
            }
        }
        self.rows = rows;
        self.cols = cols;
        self.cursor.row = self.cursor.row.min(rows - 1);
        self.cursor.col = self.cursor.col.min(cols - 1);
        self.pending_wrap = false;
    }

    fn active_grid(&self) -> &Grid {
        if self.alt_active { &self.alt } else { &self.primary }
    }

    fn active_grid_mut(&mut self) -> &mut Grid {
        if self.alt_active { &mut self.alt } else { &mut self.primary }
    }

    fn step(&mut self, byte: u8) {
        match self.state {
            State::Ground => self.ground(byte),
            State::Escape => self.escape(byte),
            State::Csi => self.csi(byte),
            State::Osc => {
                match byte {
                    0x07 => self.state = State::Ground,
                    0x1b => self.state = State::OscEscape,
                    _ => {}
                }
            }
            State::OscEscape => self.state = State::Ground,
            State::Charset => self.state = State::Ground,
        }
    }

    fn ground(&mut self, byte: u8) {
        if self.utf8_remaining > 0 && (0x80..0xc0).contains(&byte) {
            self.utf8.push(byte);
            self.utf8_remaining -= 1;
            if self.utf8_remaining == 0 {
                let ch = std::str::from_utf8(&self.utf8)
                    .ok()
                    .and_then(|s| s.chars().next())
                    .unwrap_or('\u{fffd}');
                self.utf8.clear();
                self.print(ch);
            }
            return;
        }
        self.utf8.clear();
        self.utf8_remaining = 0;

        match byte {
            0x1b => self.state = State::Escape,
            b'\r' => {
                self.cursor.col = 0;
                self.pending_wrap = false;
            }
            b'\n' | 0x0b | 0x0c => self.linefeed(),
            0x08 => {
                self.cursor.col = self.cursor.col.saturating_sub(1);
                self.pending_wrap = false;
            }
            b'\t' => {
                let next_stop = (self.cursor.col / 8 + 1) * 8;
                self.cursor.col = next_stop.min(self.cols - 1);
                self.pending_wrap = false;
            }
            0x00..=0x1f => {}
            0x20..=0x7e => self.print(byte as char),
            0x7f => {}
            0xc0..=0xdf => self.start_utf8(byte, 1),
            0xe0..=0xef => self.start_utf8(byte, 2),
            0xf0..=0xf7 => self.start_utf8(byte, 3),
            _ => self.print('\u{fffd}'),
        }
    }

    fn start_utf8(&mut self, lead: u8, continuation: usize) {
        self.utf8.clear();
        self.utf8.push(lead);
        self.utf8_remaining = continuation;
    }

    fn escape(&mut self, byte: u8) {
        self.state = State::Ground;
        match byte {
            b'[' => {
                self.params.clear();
                self.current_param = 0;
                self.has_param = false;
                self.private_marker = false;
                self.state = State::Csi;
            }
            b']' => self.state = State::Osc,
            b'(' | b')' => self.state = State::Charset,
            b'7' => self.saved_cursor = self.cursor,
            b'8' => {
                self.cursor = self.saved_cursor;
                self.clamp_cursor();
                self.pending_wrap = false;
            }
            b'D' => self.linefeed(),
            b'E' => {
                self.cursor.col = 0;
                self.linefeed();
            }
            b'M' => self.reverse_linefeed(),
            b'c' => {
                let (rows, cols) = (self.rows as u16, self.cols as u16);
                *self = Screen::new(rows, cols);
            }
            _ => {}
        }
    }

    fn csi(&mut self, byte: u8) {
        match byte {
            b'0'..=b'9' => {
                self.current_param = self
                    .current_param
                    .saturating_mul(10)
                    .saturating_add(u16::from(byte - b'0'));
                self.has_param = true;
            }
            b';' => {
                self.params.push(self.current_param);
                self.current_param = 0;
                self.has_param = false;
            }
            b'?' => self.private_marker = true,
            // Intermediate and other prefix bytes carry nothing we act on.
            0x20..=0x2f | b':' | b'<' | b'=' | b'>' => {}
            0x40..=0x7e => {
                if self.has_param || !self.params.is_empty() {
                    self.params.push(self.current_param);
                }
                let private = self.private_marker;
                self.state = State::Ground;
                self.dispatch_csi(byte, private);
            }
            // ESC aborts the sequence and starts a new one.
            0x1b => self.state = State::Escape,
            // Other C0 controls execute even in the middle of a sequence.
            0x00..=0x1f => {
                let state = self.state;
                self.state = State::Ground;
                self.ground(byte);
                self.state = state;
            }
            _ => self.state = State::Ground,
        }
    }

    fn count_param(&self, index: usize) -> usize {
        match self.params.get(index) {
            Some(&value) if value != 0 => value as usize,
            _ => 1,
        }
    }

    fn raw_param(&self, index: usize) -> u16 {
        self.params.get(index).copied().unwrap_or(0)
    }

    fn dispatch_csi(&mut self, action: u8, private: bool) {
        if private {
            match action {
                b'h' => self.set_modes(true),
                b'l' => self.set_modes(false),
                _ => {}
            }
            return;
        }
        match action {
            b'm' => {} // SGR: attributes are not tracked
            b'H' | b'f' => {
                let row = self.count_param(0) - 1;
                let col = self.count_param(1) - 1;
                self.cursor.row = row.min(self.rows - 1);
                self.cursor.col = col.min(self.cols - 1);
                self.pending_wrap = false;
            }
            b'A' => {
                self.cursor.row = self.cursor.row.saturating_sub(self.count_param(0));
                self.pending_wrap = false;
            }
            b'B' => {
                self.cursor.row = (self.cursor.row + self.count_param(0)).min(self.rows - 1);
                self.pending_wrap = false;
            }
            b'C' => {
                self.cursor.col = (self.cursor.col + self.count_param(0)).min(self.cols - 1);
                self.pending_wrap = false;
            }
            b'D' => {
                self.cursor.col = self.cursor.col.saturating_sub(self.count_param(0));
                self.pending_wrap = false;
            }
            b'G' => {
                self.cursor.col = (self.count_param(0) - 1).min(self.cols - 1);
                self.pending_wrap = false;
            }
            b'J' => self.erase_display(self.raw_param(0)),
            b'K' => self.erase_line(self.raw_param(0)),
            b'S' => {
                for _ in 0..self.count_param(0) {
                    self.scroll_up();
                }
            }
            b'T' => {
                for _ in 0..self.count_param(0) {
                    self.reverse_linefeed_at_top();
                }
            }
            _ => {}
        }
    }

    fn set_modes(&mut self, enable: bool) {
        for i in 0..self.params.len() {
            match self.params[i] {
                47 | 1047 => self.switch_alt(enable, false),
                1049 => self.switch_alt(enable, true),
                _ => {}
            }
        }
    }

    fn switch_alt(&mut self, enable: bool, with_cursor: bool) {
        if enable && !self.alt_active {
            if with_cursor {
                self.saved_cursor = self.cursor;
            }
            self.alt = blank_grid(self.rows, self.cols);
            self.alt_active = true;
            self.cursor = Cursor::default();
            self.pending_wrap = false;
        } else if !enable && self.alt_active {
            self.alt_active = false;
            if with_cursor {
                self.cursor = self.saved_cursor;
                self.clamp_cursor();
            }
            self.pending_wrap = false;
        }
    }

    fn print(&mut self, ch: char) {
        if self.pending_wrap {
            self.cursor.col = 0;
            self.linefeed();
        }
        let (row, col) = (self.cursor.row, self.cursor.col);
        self.active_grid_mut()[row][col] = ch;
        if self.cursor.col + 1 < self.cols {
            self.cursor.col += 1;
        } else {
            self.pending_wrap = true;
        }
    }

    fn linefeed(&mut self) {
        self.pending_wrap = false;
        if self.cursor.row + 1 < self.rows {
            self.cursor.row += 1;
        } else {
            self.scroll_up();
        }
    }

    fn scroll_up(&mut self) {
        let alt = self.alt_active;
        let cols = self.cols;
        let grid = self.active_grid_mut();
        let top = grid.remove(0);
        grid.push(blank_row(cols));
        // The alternate screen has no scrollback.
        if !alt {
            self.scrollback.push(top);
        }
    }

    fn reverse_linefeed(&mut self) {
        self.pending_wrap = false;
        if self.cursor.row > 0 {
            self.cursor.row -= 1;
        } else {
            self.reverse_linefeed_at_top();
        }
    }

    fn reverse_linefeed_at_top(&mut self) {
        let cols = self.cols;
        let grid = self.active_grid_mut();
        grid.pop();
        grid.insert(0, blank_row(cols));
    }

    fn erase_display(&mut self, mode: u16) {
        let row = self.cursor.row;
        let rows = self.rows;
        match mode {
            0 => {
                self.erase_line(0);
                let grid = self.active_grid_mut();
                for r in row + 1..rows {
                    grid[r].fill(' ');
                }
            }
            1 => {
                self.erase_line(1);
                let grid = self.active_grid_mut();
                for r in 0..row {
                    grid[r].fill(' ');
                }
            }
            2 => {
                self.active_grid_mut().iter_mut().for_each(|r| r.fill(' '));
            }
            3 => {
                self.active_grid_mut().iter_mut().for_each(|r| r.fill(' '));
                self.scrollback.clear();
            }
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let (row, col) = (self.cursor.row, self.cursor.col);
        let cols = self.cols;
        let line = &mut self.active_grid_mut()[row];
        match mode {
            0 => line[col..cols].fill(' '),
            1 => line[..=col].fill(' '),
            2 => line.fill(' '),
            _ => {}
        }
    }

    fn clamp_cursor(&mut self) {
        self.cursor.row = self.cursor.row.min(self.rows - 1);
        self.cursor.col = self.cursor.col.min(self.cols - 1);
    }
}

/// Joins a buffer into assertion text: cells within a row and rows between
/// each other are concatenated with no separator, trailing spaces preserved.
pub fn render_text(buffer: &[Vec<char>]) -> String {
    buffer.iter().flat_map(|row| row.iter()).collect()
}

/// Joins a buffer with one line per row, for snapshot files.
pub fn render_lines(buffer: &[Vec<char>]) -> String {
    buffer
        .iter()
        .map(|row| row.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(rows: u16, cols: u16, bytes: &[u8]) -> Screen {
        let mut screen = Screen::new(rows, cols);
        screen.advance(bytes);
        screen
    }

    fn line(screen: &Screen, row: usize) -> String {
        screen.viewable_buffer()[row].iter().collect()
    }

    #[test]
    fn printable_text_advances_the_cursor() {
        let screen = feed(4, 10, b"hi");
        assert_eq!(line(&screen, 0), "hi        ");
        assert_eq!(screen.cursor_position(), (0, 2));
    }

    #[test]
    fn auto_wrap_is_deferred_past_the_last_column() {
        let screen = feed(4, 4, b"abcdef");
        assert_eq!(line(&screen, 0), "abcd");
        assert_eq!(line(&screen, 1), "ef  ");
    }

    #[test]
    fn cr_lf_and_backspace() {
        let screen = feed(4, 10, b"abc\r\ndef\x08X");
        assert_eq!(line(&screen, 0), "abc       ");
        assert_eq!(line(&screen, 1), "deX       ");
    }

    #[test]
    fn lf_alone_keeps_the_column() {
        let screen = feed(4, 10, b"ab\ncd");
        assert_eq!(line(&screen, 0), "ab        ");
        assert_eq!(line(&screen, 1), "  cd      ");
    }

    #[test]
    fn tab_moves_to_the_next_stop() {
        let screen = feed(2, 20, b"a\tb");
        assert_eq!(line(&screen, 0), "a       b           ");
    }

    #[test]
    fn scrolled_lines_enter_scrollback() {
        let screen = feed(2, 3, b"a\r\nb\r\nc\r\nd");
        // Two lines scrolled off the top.
        let full = screen.buffer();
        assert_eq!(full.len(), 4);
        assert_eq!(render_lines(&full), "a  \nb  \nc  \nd  ");
        assert_eq!(render_lines(&screen.viewable_buffer()), "c  \nd  ");
    }

    #[test]
    fn sgr_is_consumed_without_touching_the_grid() {
        let screen = feed(2, 10, b"\x1b[1;31mred\x1b[0m");
        assert_eq!(line(&screen, 0), "red       ");
    }

    #[test]
    fn cursor_positioning_is_one_based_and_clamped() {
        let screen = feed(4, 10, b"\x1b[2;3Hx\x1b[99;99Hy");
        assert_eq!(line(&screen, 1), "  x       ");
        assert_eq!(line(&screen, 3), "         y");
    }

    #[test]
    fn relative_cursor_movement() {
        let screen = feed(4, 10, b"\x1b[2;2Hx\x1b[1A\x1b[2Du\x1b[2B\x1b[1Cd");
        assert_eq!(line(&screen, 0), "u         ");
        assert_eq!(line(&screen, 1), " x        ");
        assert_eq!(line(&screen, 2), "  d       ");
    }

    #[test]
    fn erase_display_variants() {
        let screen = feed(3, 3, b"aaa\r\nbbb\r\nccc\x1b[2;2H\x1b[0J");
        assert_eq!(render_lines(&screen.viewable_buffer()), "aaa\nb  \n   ");

        let screen = feed(3, 3, b"aaa\r\nbbb\r\nccc\x1b[2;2H\x1b[1J");
        assert_eq!(render_lines(&screen.viewable_buffer()), "   \n  b\nccc");

        let screen = feed(3, 3, b"aaa\r\nbbb\r\nccc\x1b[2J");
        assert_eq!(render_lines(&screen.viewable_buffer()), "   \n   \n   ");
    }

    #[test]
    fn erase_in_line_variants() {
        let screen = feed(1, 5, b"abcde\x1b[1;3H\x1b[K");
        assert_eq!(line(&screen, 0), "ab   ");

        let screen = feed(1, 5, b"abcde\x1b[1;3H\x1b[1K");
        assert_eq!(line(&screen, 0), "   de");

        let screen = feed(1, 5, b"abcde\x1b[2K");
        assert_eq!(line(&screen, 0), "     ");
    }

    #[test]
    fn erase_scrollback_with_ed3() {
        let mut screen = feed(2, 3, b"a\r\nb\r\nc");
        assert_eq!(screen.buffer().len(), 3);
        screen.advance(b"\x1b[3J");
        assert_eq!(screen.buffer().len(), 2);
    }

    #[test]
    fn alternate_screen_routes_writes_and_preserves_primary() {
        let mut screen = feed(2, 5, b"main");
        screen.advance(b"\x1b[?1049halt");
        assert_eq!(line(&screen, 0), "alt  ");

        // Scrolling on the alt screen must not grow scrollback.
        screen.advance(b"\r\n\r\n\r\n\r\n");
        assert_eq!(screen.buffer().len(), 2);

        screen.advance(b"\x1b[?1049l");
        assert_eq!(line(&screen, 0), "main ");
    }

    #[test]
    fn save_and_restore_cursor() {
        let screen = feed(3, 10, b"\x1b[2;4H\x1b7\x1b[1;1H\x1b8x");
        assert_eq!(line(&screen, 1), "   x      ");
    }

    #[test]
    fn osc_titles_are_swallowed() {
        let screen = feed(2, 10, b"\x1b]0;title\x07ok\x1b]2;t\x1b\\!");
        assert_eq!(line(&screen, 0), "ok!       ");
    }

    #[test]
    fn utf8_text_is_decoded() {
        let screen = feed(2, 10, "héllo ⚡".as_bytes());
        assert_eq!(line(&screen, 0), "héllo ⚡   ");
    }

    #[test]
    fn resize_pads_and_clamps() {
        let mut screen = feed(2, 4, b"abcd\r\nef");
        screen.resize(3, 6);
        assert_eq!(line(&screen, 0), "abcd  ");
        assert_eq!(line(&screen, 2), "      ");
        screen.advance(b"X");
        assert_eq!(line(&screen, 1), "efX   ");
    }

    #[test]
    fn identical_streams_produce_identical_buffers() {
        let stream: &[u8] = b"ls\r\n\x1b[31mfile\x1b[0m\r\n\x1b[2;1Hdone\x1b[K\tx";
        let a = feed(5, 12, stream);
        let b = feed(5, 12, stream);
        assert_eq!(a.buffer(), b.buffer());
        assert_eq!(a.viewable_buffer(), b.viewable_buffer());
    }

    #[test]
    fn render_text_concatenates_without_separators() {
        let screen = feed(2, 3, b"ab\r\ncd");
        assert_eq!(render_text(&screen.viewable_buffer()), "ab cd ");
    }
}
