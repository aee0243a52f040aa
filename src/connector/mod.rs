//! Negotiation with the optional host console extension.
//!
//! When the extension is present it supplies the read-input and write-text
//! primitives; otherwise the bridge talks to its own terminal directly.

pub mod abi;
mod console;


use std::ffi::{c_void, CStr, CString};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::BridgeError;
use abi::{ConnectorMode, ConnectorParams, EntryFn, InputRecord, ReadInputFn, WriteStream, WriteTextFn};

pub use console::{ConsoleSink, DirectConsole, ExtensionConsole};

/// Negotiation inputs.
#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Searched before the default library path.
    pub base_dir: Option<PathBuf>,
    pub verbose: bool,
    pub tty_name: Option<String>,
    pub term: String,
    pub mount_prefix: Option<String>,
    /// A failed negotiation aborts startup instead of falling back.
    pub required: bool,
}

/// Capabilities handed out by a successfully negotiated extension.
///
/// Valid until [`ConsoleConnector::stop`] runs.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleBinding {
    read_input: ReadInputFn,
    write_text: WriteTextFn,
}

/// Result of one `read_input` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBatch {
    pub delivered: usize,
    pub more: bool,
}

impl ConsoleBinding {
    #[cfg(test)]
    pub(crate) fn from_fns(read_input: ReadInputFn, write_text: WriteTextFn) -> Self {
        Self {
            read_input,
            write_text,
        }
    }

    /// Ask the extension for pending console events.
    pub fn read_input(&self, buffer: &mut [InputRecord]) -> ReadBatch {
        let capacity = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        let mut delivered = 0u32;
        // SAFETY: buffer is valid for `capacity` records; the extension fills at most that many.
        let result = unsafe { (self.read_input)(buffer.as_mut_ptr(), capacity, &mut delivered) };
        if result & abi::READ_READY == 0 {
            return ReadBatch {
                delivered: 0,
                more: false,
            };
        }
        ReadBatch {
            delivered: (delivered as usize).min(buffer.len()),
            more: result & abi::READ_MORE != 0,
        }
    }

    /// One `write_text` call; returns the number of bytes the extension consumed.
    pub fn write_text(&self, bytes: &[u8], stream: WriteStream) -> io::Result<usize> {
        let len = i32::try_from(bytes.len()).unwrap_or(i32::MAX);
        let mut written = 0u32;
        // SAFETY: bytes is valid for `len` bytes; the extension only reads from it.
        let ok = unsafe { (self.write_text)(bytes.as_ptr().cast(), len, &mut written, stream as u32) };
        if ok == 0 {
            return Err(io::Error::other("console extension rejected write"));
        }
        Ok(written as usize)
    }
}

/// Owns the loaded extension and its binding for the life of the process.
#[derive(Debug, Default)]
pub struct ConsoleConnector {
    module: Option<LoadedModule>,
    entry: Option<EntryFn>,
    binding: Option<ConsoleBinding>,
    strings: NegotiationStrings,
    verbose: bool,
    last_error: Option<String>,
}

impl ConsoleConnector {
    /// Locate the extension and run the `Start` round trip.
    ///
    /// A missing or uncooperative extension yields `Ok(None)` unless
    /// `options.required` is set.
    pub fn negotiate(
        &mut self,
        options: &ConnectorOptions,
    ) -> Result<Option<ConsoleBinding>, BridgeError> {
        if let Some(binding) = self.binding {
            return Ok(Some(binding));
        }
        let module = match LoadedModule::locate(options.base_dir.as_deref()) {
            Ok(module) => module,
            Err(reason) => return self.fail(options, reason),
        };
        let entry = match module.entry_point() {
            Some(entry) => entry,
            None => {
                return self.fail(
                    options,
                    format!("{} is missing from the extension", entry_symbol_name()),
                )
            }
        };
        self.module = Some(module);
        self.start(entry, options)
    }

    /// Run the `Start` round trip against an already resolved entry point.
    #[cfg(test)]
    pub(crate) fn negotiate_with(
        &mut self,
        entry: EntryFn,
        options: &ConnectorOptions,
    ) -> Result<Option<ConsoleBinding>, BridgeError> {
        self.start(entry, options)
    }

    fn start(
        &mut self,
        entry: EntryFn,
        options: &ConnectorOptions,
    ) -> Result<Option<ConsoleBinding>, BridgeError> {
        self.verbose = options.verbose;
        self.strings = NegotiationStrings::new(options);
        let mut params = self.params(ConnectorMode::Start);

        // SAFETY: params is a fully initialized, size-prefixed block whose strings outlive the call.
        let rc = unsafe { entry(&mut params) };
        let detail = error_detail(&params);
        if rc != 0 {
            self.module = None;
            return self.fail(options, format!("negotiation returned {rc}. {detail}"));
        }
        let (Some(read_input), Some(write_text)) = (params.read_input, params.write_text) else {
            self.module = None;
            return self.fail(options, format!("negotiation returned no capabilities. {detail}"));
        };

        let binding = ConsoleBinding {
            read_input,
            write_text,
        };
        self.entry = Some(entry);
        self.binding = Some(binding);
        info!("console extension negotiated");
        Ok(Some(binding))
    }

    fn params(&self, mode: ConnectorMode) -> ConnectorParams {
        let mut params = ConnectorParams::new(mode);
        params.verbose = i32::from(self.verbose);
        params.tty_name = self.strings.tty_name.as_ref().map_or(std::ptr::null(), |s| s.as_ptr());
        params.term = self.strings.term.as_ref().map_or(std::ptr::null(), |s| s.as_ptr());
        params.mount_prefix = self
            .strings
            .mount_prefix
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr());
        params
    }

    fn fail(
        &mut self,
        options: &ConnectorOptions,
        reason: String,
    ) -> Result<Option<ConsoleBinding>, BridgeError> {
        if options.required {
            warn!("console extension unavailable: {reason}");
            self.last_error = Some(reason.clone());
            return Err(BridgeError::Negotiation(reason));
        }
        debug!("console extension unavailable, using direct console: {reason}");
        self.last_error = Some(reason);
        Ok(None)
    }

    pub fn binding(&self) -> Option<ConsoleBinding> {
        self.binding
    }

    /// Why the last negotiation fell back, for verbose reporting.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Send `Stop` if negotiation had succeeded, then release the module.
    pub fn stop(&mut self) {
        if let (Some(entry), Some(_)) = (self.entry.take(), self.binding.take()) {
            let mut params = self.params(ConnectorMode::Stop);
            // SAFETY: same contract as the `Start` call.
            let rc = unsafe { entry(&mut params) };
            debug!(rc, "console extension stopped");
        }
        self.module = None;
    }
}

impl Drop for ConsoleConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn error_detail(params: &ConnectorParams) -> String {
    if params.error.is_null() {
        return String::new();
    }
    // SAFETY: the extension promises a NUL-terminated string when `error` is set.
    unsafe { CStr::from_ptr(params.error) }
        .to_string_lossy()
        .into_owned()
}

fn entry_symbol_name() -> &'static str {
    std::str::from_utf8(&abi::ENTRY_SYMBOL[..abi::ENTRY_SYMBOL.len() - 1]).unwrap_or("entry point")
}

/// Strings referenced by the parameter block; kept alive with the connector.
#[derive(Debug, Default)]
struct NegotiationStrings {
    tty_name: Option<CString>,
    term: Option<CString>,
    mount_prefix: Option<CString>,
}

impl NegotiationStrings {
    fn new(options: &ConnectorOptions) -> Self {
        let to_c = |value: Option<&str>| value.and_then(|s| CString::new(s).ok());
        Self {
            tty_name: to_c(options.tty_name.as_deref()),
            term: to_c(Some(options.term.as_str())),
            mount_prefix: to_c(options.mount_prefix.as_deref()),
        }
    }
}

/// A `dlopen` handle closed on drop.
#[derive(Debug)]
struct LoadedModule {
    handle: *mut c_void,
}

impl LoadedModule {
    fn locate(base_dir: Option<&Path>) -> Result<Self, String> {
        let name = abi::module_file_name();
        if let Some(dir) = base_dir {
            match Self::open(&dir.join(name)) {
                Ok(module) => return Ok(module),
                Err(reason) => debug!("extension not loaded from {}: {reason}", dir.display()),
            }
        }
        Self::open(Path::new(name))
    }

    fn open(path: &Path) -> Result<Self, String> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format!("{} contains a NUL byte", path.display()))?;
        // SAFETY: c_path is a valid NUL-terminated path.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(format!("{} is not found: {}", path.display(), dl_error()));
        }
        Ok(Self { handle })
    }

    fn entry_point(&self) -> Option<EntryFn> {
        // SAFETY: handle is a live dlopen handle and the symbol name is NUL-terminated.
        let symbol = unsafe { libc::dlsym(self.handle, abi::ENTRY_SYMBOL.as_ptr().cast()) };
        if symbol.is_null() {
            return None;
        }
        // SAFETY: the exported symbol has the documented entry signature.
        Some(unsafe { std::mem::transmute::<*mut c_void, EntryFn>(symbol) })
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread-local message or null.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dlopen error".to_string();
    }
    // SAFETY: non-null dlerror results are NUL-terminated.
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}
