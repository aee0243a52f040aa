//! C layout shared with the host console extension.
//!
//! The extension exports a single entry point that receives a size-prefixed
//! parameter block. The bridge fills the IN fields; on `Start` the extension
//! fills the capabilities (or `error`), on `Stop` it only acknowledges.

use std::ffi::c_char;

/// Exported negotiation entry point.
pub const ENTRY_SYMBOL: &[u8] = b"ptybridge_request_connector\0";

/// Architecture-specific module name looked up by `dlopen`.
pub fn module_file_name() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "libptybridge_connector64.so"
    } else {
        "libptybridge_connector.so"
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorMode {
    Start = 1,
    Stop = 2,
}

/// Stream selector for `write_text`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStream {
    Output = 1,
    Error = 2,
}

/// Bits returned by `read_input`.
pub const READ_NONE: u32 = 0;
pub const READ_READY: u32 = 1;
pub const READ_MORE: u32 = 2;

/// `InputRecord::kind` values.
pub const KEY_EVENT: u32 = 1;
pub const WINDOW_RESIZE_EVENT: u32 = 2;

/// `InputRecord::control_state` bits.
pub const RIGHT_CTRL_PRESSED: u32 = 0x0004;
pub const LEFT_CTRL_PRESSED: u32 = 0x0008;

/// One console event as delivered by the extension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputRecord {
    pub kind: u32,
    pub key_down: u32,
    pub unicode_char: u32,
    pub control_state: u32,
    pub virtual_key: u16,
    pub columns: u16,
    pub rows: u16,
    pub reserved: u16,
}

/// Fills up to `capacity` records and stores the delivered count.
pub type ReadInputFn =
    unsafe extern "C" fn(buffer: *mut InputRecord, capacity: u32, delivered: *mut u32) -> u32;

/// Writes `len` bytes (or a NUL-terminated string when `len == -1`); returns
/// nonzero on success and stores the number of bytes consumed.
pub type WriteTextFn = unsafe extern "C" fn(
    buffer: *const c_char,
    len: i32,
    written: *mut u32,
    stream: u32,
) -> i32;

#[repr(C)]
#[derive(Debug)]
pub struct ConnectorParams {
    pub size: u32,
    pub mode: u32,
    pub verbose: i32,
    pub tty_name: *const c_char,
    pub term: *const c_char,
    pub mount_prefix: *const c_char,
    pub error: *const c_char,
    pub read_input: Option<ReadInputFn>,
    pub write_text: Option<WriteTextFn>,
}

impl ConnectorParams {
    pub fn new(mode: ConnectorMode) -> Self {
        Self {
            size: std::mem::size_of::<Self>() as u32,
            mode: mode as u32,
            verbose: 0,
            tty_name: std::ptr::null(),
            term: std::ptr::null(),
            mount_prefix: std::ptr::null(),
            error: std::ptr::null(),
            read_input: None,
            write_text: None,
        }
    }
}

/// Signature of [`ENTRY_SYMBOL`]. Zero means success.
pub type EntryFn = unsafe extern "C" fn(params: *mut ConnectorParams) -> i32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_size_prefixed() {
        let params = ConnectorParams::new(ConnectorMode::Stop);
        assert_eq!(params.size as usize, std::mem::size_of::<ConnectorParams>());
        assert_eq!(params.mode, 2);
        assert!(params.read_input.is_none());
    }

    #[test]
    fn input_record_layout_is_packed_without_padding() {
        assert_eq!(std::mem::size_of::<InputRecord>(), 24);
    }

    #[test]
    fn module_name_matches_pointer_width() {
        let name = module_file_name();
        assert!(name.starts_with("libptybridge_connector"));
        assert_eq!(name.contains("64"), cfg!(target_pointer_width = "64"));
    }
}
