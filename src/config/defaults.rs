pub(super) const FALLBACK_TERM: &str = "xterm-256color";
/// Marker argument asking for the default login shell.
pub(super) const DEFAULT_SHELL_MARKER: &str = "-";
pub(super) const MAX_TERM_LEN: usize = 64;

pub(super) fn default_term() -> String {
    FALLBACK_TERM.to_string()
}
