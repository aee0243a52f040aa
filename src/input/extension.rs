use tracing::{debug, trace};

use super::{ConsoleEvent, InputPoll, InputSource};
use crate::connector::abi::{
    InputRecord, KEY_EVENT, LEFT_CTRL_PRESSED, RIGHT_CTRL_PRESSED, WINDOW_RESIZE_EVENT,
};
use crate::connector::ConsoleBinding;

/// Records requested per `read_input` call.
const RECORDS_PER_READ: usize = 32;

const VK_SPACE: u16 = 0x20;
const VK_2: u16 = 0x32;
const VK_BACKQUOTE: u16 = 0xc0;

/// Map one extension record to a console event.
///
/// Key-ups and keys without a character are dropped; Ctrl+Space (and the
/// Ctrl+2 / Ctrl+` aliases) become NUL.
pub fn translate_record(record: &InputRecord) -> Option<ConsoleEvent> {
    match record.kind {
        KEY_EVENT => {
            if record.key_down == 0 {
                trace!(vk = record.virtual_key, "key-up skipped");
                return None;
            }
            let ctrl = record.control_state & (LEFT_CTRL_PRESSED | RIGHT_CTRL_PRESSED) != 0;
            if ctrl && matches!(record.virtual_key, VK_SPACE | VK_2 | VK_BACKQUOTE) {
                return Some(ConsoleEvent::Key {
                    ch: '\0',
                    is_down: true,
                });
            }
            if record.unicode_char == 0 {
                return None;
            }
            char::from_u32(record.unicode_char).map(|ch| ConsoleEvent::Key { ch, is_down: true })
        }
        WINDOW_RESIZE_EVENT => Some(ConsoleEvent::Resize {
            columns: record.columns,
            rows: record.rows,
        }),
        other => {
            debug!(kind = other, "ignoring console event");
            None
        }
    }
}

/// Input read synchronously through the negotiated read-input capability.
#[derive(Debug)]
pub struct ExtensionInputSource {
    binding: ConsoleBinding,
    records: [InputRecord; RECORDS_PER_READ],
    stopped: bool,
}

impl ExtensionInputSource {
    pub fn new(binding: ConsoleBinding) -> Self {
        Self {
            binding,
            records: [InputRecord::default(); RECORDS_PER_READ],
            stopped: false,
        }
    }
}

impl InputSource for ExtensionInputSource {
    fn poll_events(&mut self, out: &mut Vec<ConsoleEvent>) -> InputPoll {
        if self.stopped {
            return InputPoll::Idle;
        }
        let batch = self.binding.read_input(&mut self.records);
        if batch.delivered == 0 {
            return InputPoll::Idle;
        }
        out.extend(self.records[..batch.delivered].iter().filter_map(translate_record));
        if batch.more {
            InputPoll::ReadyMore
        } else {
            InputPoll::Ready
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::abi::{READ_NONE, READ_READY};
    use std::ffi::c_char;

    fn key(ch: char) -> InputRecord {
        InputRecord {
            kind: KEY_EVENT,
            key_down: 1,
            unicode_char: ch as u32,
            ..InputRecord::default()
        }
    }

    #[test]
    fn key_down_with_character_is_translated() {
        assert_eq!(
            translate_record(&key('é')),
            Some(ConsoleEvent::Key {
                ch: 'é',
                is_down: true
            })
        );
    }

    #[test]
    fn key_up_and_bare_modifiers_are_skipped() {
        let mut up = key('a');
        up.key_down = 0;
        assert_eq!(translate_record(&up), None);
        assert_eq!(translate_record(&key('\0')), None);
    }

    #[test]
    fn ctrl_space_produces_nul() {
        for vk in [VK_SPACE, VK_2, VK_BACKQUOTE] {
            let record = InputRecord {
                kind: KEY_EVENT,
                key_down: 1,
                virtual_key: vk,
                control_state: LEFT_CTRL_PRESSED,
                ..InputRecord::default()
            };
            assert_eq!(
                translate_record(&record),
                Some(ConsoleEvent::Key {
                    ch: '\0',
                    is_down: true
                })
            );
        }
    }

    #[test]
    fn resize_record_carries_dimensions() {
        let record = InputRecord {
            kind: WINDOW_RESIZE_EVENT,
            columns: 120,
            rows: 40,
            ..InputRecord::default()
        };
        assert_eq!(
            translate_record(&record),
            Some(ConsoleEvent::Resize {
                columns: 120,
                rows: 40
            })
        );
        let focus = InputRecord {
            kind: 16,
            ..InputRecord::default()
        };
        assert_eq!(translate_record(&focus), None);
    }

    unsafe extern "C" fn one_key(buffer: *mut InputRecord, _capacity: u32, delivered: *mut u32) -> u32 {
        *buffer = InputRecord {
            kind: KEY_EVENT,
            key_down: 1,
            unicode_char: 'q' as u32,
            ..InputRecord::default()
        };
        *delivered = 1;
        READ_READY
    }

    unsafe extern "C" fn nothing(_buffer: *mut InputRecord, _capacity: u32, delivered: *mut u32) -> u32 {
        *delivered = 0;
        READ_NONE
    }

    unsafe extern "C" fn sink(_buffer: *const c_char, len: i32, written: *mut u32, _stream: u32) -> i32 {
        *written = len.max(0) as u32;
        1
    }

    #[test]
    fn source_reports_ready_and_idle() {
        let mut source = ExtensionInputSource::new(ConsoleBinding::from_fns(one_key, sink));
        let mut events = Vec::new();
        assert_eq!(source.poll_events(&mut events), InputPoll::Ready);
        assert_eq!(
            events,
            vec![ConsoleEvent::Key {
                ch: 'q',
                is_down: true
            }]
        );

        let mut idle = ExtensionInputSource::new(ConsoleBinding::from_fns(nothing, sink));
        assert_eq!(idle.poll_events(&mut events), InputPoll::Idle);

        source.stop();
        assert_eq!(source.poll_events(&mut events), InputPoll::Idle);
    }
}
