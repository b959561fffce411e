//! `InterfaceLib`, the Toolbox entry points.
//!
//! Time and QuickDraw state are serviced locally. Event and sound calls need a window server
//! and go to the UI helper over a [`UiChannel`]; without one they fail with
//! [`crate::Error::ChannelUnavailable`].

use std::{sync::Arc, time::Instant};

use log::{debug, info};

use crate::{
    bridge::{
        DataExport, Library, LibraryContext, MachineState, Trampoline, UiChannel, UiMessage,
    },
    memory::{AddressSpace, Allocator, GuestAddress},
    Error::ChannelUnavailable,
    Result,
};

/// Size of the Globals block.
pub const GLOBALS_SIZE: usize = 336;
/// Size of a guest `EventRecord`.
pub const EVENT_RECORD_SIZE: usize = 16;

const TICKS_PER_SECOND: u128 = 60;

// Globals block
const PORT: u32 = 0;
const PORT_SIZE: usize = 108;
const QD: u32 = 112;
const SYSTEM_FATAL_ERROR_HANDLER: u32 = 320;

// QDGlobals, relative to `qd`
const QD_RAND_SEED: u32 = 76;
const QD_DK_GRAY: u32 = 162;
const QD_LT_GRAY: u32 = 170;
const QD_GRAY: u32 = 178;
const QD_BLACK: u32 = 186;
const QD_WHITE: u32 = 194;
const QD_THE_PORT: u32 = 202;

const PATTERNS: [(u32, [u8; 8]); 5] = [
    (QD_DK_GRAY, [0x77, 0xDD, 0x77, 0xDD, 0x77, 0xDD, 0x77, 0xDD]),
    (QD_LT_GRAY, [0x88, 0x22, 0x88, 0x22, 0x88, 0x22, 0x88, 0x22]),
    (QD_GRAY, [0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55]),
    (QD_BLACK, [0xFF; 8]),
    (QD_WHITE, [0x00; 8]),
];

/// Host implementation of `InterfaceLib`.
pub struct InterfaceLib {
    space: Arc<AddressSpace>,
    globals: GuestAddress,
    channel: Option<UiChannel>,
    started: Instant,
}

impl InterfaceLib {
    /// Guest address of the Globals block.
    #[must_use]
    pub fn globals(&self) -> GuestAddress {
        self.globals
    }

    /// Guest address of the library's `GrafPort`.
    #[must_use]
    pub fn port(&self) -> GuestAddress {
        self.field(PORT)
    }

    /// Guest address of the QuickDraw globals, exported as `qd`.
    #[must_use]
    pub fn qd(&self) -> GuestAddress {
        self.field(QD)
    }

    /// Route UI calls over `channel`, replacing any existing one.
    pub fn attach_channel(&mut self, channel: UiChannel) {
        self.channel = Some(channel);
    }

    /// True if a UI channel is attached and usable.
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| !channel.is_faulted())
    }

    fn field(&self, offset: u32) -> GuestAddress {
        GuestAddress(self.globals.value() + offset)
    }

    fn channel(&mut self) -> Result<&mut UiChannel> {
        self.channel.as_mut().ok_or(ChannelUnavailable)
    }
}

impl Library for InterfaceLib {
    const NAME: &'static str = "InterfaceLib";

    fn load(context: &LibraryContext) -> Result<Self> {
        let space = context.space.clone();
        let globals = space.allocate(GLOBALS_SIZE, "InterfaceLib Globals")?;

        let channel = match &context.ui_head {
            Some(program) => match UiChannel::spawn(program, &context.ui_head_args) {
                Ok(channel) => Some(channel),
                Err(error) => {
                    space.deallocate(globals)?;
                    return Err(error);
                }
            },
            None => None,
        };

        if channel.is_some() {
            info!("InterfaceLib attached to UI helper");
        }

        Ok(InterfaceLib {
            space,
            globals,
            channel,
            started: Instant::now(),
        })
    }

    fn trampolines() -> &'static [(&'static str, Trampoline<Self>)] {
        TRAMPOLINES
    }

    fn data_exports() -> &'static [DataExport<Self>] {
        DATA_EXPORTS
    }

    fn unload(mut self) -> Result<()> {
        drop(self.channel.take());
        self.space.deallocate(self.globals)
    }
}

static TRAMPOLINES: &[(&str, Trampoline<InterfaceLib>)] = &[
    ("InterfaceLib_EventAvail", event_avail),
    ("InterfaceLib_GetNextEvent", get_next_event),
    ("InterfaceLib_InitGraf", init_graf),
    ("InterfaceLib_LMGetSysFatalErrorHandler", get_sys_fatal_error_handler),
    ("InterfaceLib_LMSetSysFatalErrorHandler", set_sys_fatal_error_handler),
    ("InterfaceLib_Microseconds", microseconds),
    ("InterfaceLib_SysBeep", sys_beep),
    ("InterfaceLib_TickCount", tick_count),
];

fn qd_address(library: &InterfaceLib) -> GuestAddress {
    library.qd()
}

static DATA_EXPORTS: &[DataExport<InterfaceLib>] = &[DataExport {
    name: "qd",
    accessor: qd_address,
}];

fn microseconds(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    let elapsed = library.started.elapsed().as_micros() as u64;
    let wide = state.arg_address(0);
    library.space.store(wide, (elapsed >> 32) as u32)?;
    library
        .space
        .store(GuestAddress(wide.value() + 4), elapsed as u32)
}

fn tick_count(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    let ticks = library.started.elapsed().as_millis() * TICKS_PER_SECOND / 1000;
    state.set_return(ticks as u32);
    Ok(())
}

fn sys_beep(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    let duration = state.arg(0) as i16;
    library.channel()?.perform::<()>(UiMessage::Beep, &[&duration])
}

fn next_event(library: &mut InterfaceLib, state: &mut MachineState, discard: bool) -> Result<()> {
    let mask = state.arg(0) as u16;
    let record = state.arg_address(1);

    let channel = library.channel()?;
    let event: [u8; EVENT_RECORD_SIZE] = channel.perform(UiMessage::PeekNextEvent, &[&mask])?;
    let what = u16::from_be_bytes([event[0], event[1]]);
    if discard && what != 0 {
        channel.perform::<()>(UiMessage::DiscardNextEvent, &[&mask])?;
    }

    library.space.write_bytes(record, &event)?;
    state.set_return(u32::from(what != 0));
    Ok(())
}

fn get_next_event(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    next_event(library, state, true)
}

fn event_avail(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    next_event(library, state, false)
}

fn get_sys_fatal_error_handler(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    let handler = library
        .space
        .load::<u32>(library.field(SYSTEM_FATAL_ERROR_HANDLER))?;
    state.set_return(handler);
    Ok(())
}

fn set_sys_fatal_error_handler(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    library
        .space
        .store(library.field(SYSTEM_FATAL_ERROR_HANDLER), state.arg(0))
}

fn init_graf(library: &mut InterfaceLib, state: &mut MachineState) -> Result<()> {
    let the_port = state.arg_address(0);
    let qd = library.qd();

    library.space.fill(library.port(), 0, PORT_SIZE)?;
    library
        .space
        .store(GuestAddress(qd.value() + QD_RAND_SEED), 1u32)?;
    for (offset, pattern) in PATTERNS {
        library
            .space
            .write_bytes(GuestAddress(qd.value() + offset), &pattern)?;
    }
    library.space.store(the_port, library.port().value())?;

    debug!(
        "InitGraf: port {} stored at {the_port} (qd.thePort is {})",
        library.port(),
        GuestAddress(qd.value() + QD_THE_PORT)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Write},
        sync::Mutex,
    };

    use super::*;
    use crate::{bridge::LibrarySymbol, test::address_space, Error};

    // Helper writer that keeps every request for inspection
    #[derive(Clone, Default)]
    struct Requests(Arc<Mutex<Vec<u8>>>);

    impl Write for Requests {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    // Helper function to create a response stream of `(payload)` + DONE frames
    fn responses(payloads: &[&[u8]]) -> Cursor<Vec<u8>> {
        let mut data = Vec::new();
        for payload in payloads {
            data.extend_from_slice(payload);
            data.extend_from_slice(b"DONE");
        }
        Cursor::new(data)
    }

    fn load() -> (Arc<AddressSpace>, InterfaceLib) {
        let space = address_space();
        let library = InterfaceLib::load(&LibraryContext::new(space.clone())).unwrap();
        (space, library)
    }

    fn key_down_event() -> [u8; EVENT_RECORD_SIZE] {
        let mut event = [0u8; EVENT_RECORD_SIZE];
        event[..2].copy_from_slice(&3u16.to_be_bytes());
        event[2..6].copy_from_slice(&0x0000_0061u32.to_be_bytes());
        event
    }

    #[test]
    fn exports() {
        let (_space, library) = load();
        assert_eq!(library.lookup("qd"), LibrarySymbol::Data(library.qd()));
        assert_eq!(library.qd().value(), library.globals().value() + 112);
        assert!(matches!(library.lookup("TickCount"), LibrarySymbol::Code(_)));
        assert_eq!(library.lookup("FindFolder"), LibrarySymbol::NotFound);
    }

    #[test]
    fn fatal_error_handler_slot() {
        let (_space, mut library) = load();
        let mut state = MachineState::new();
        state.gpr[3] = 0x1234_5678;
        set_sys_fatal_error_handler(&mut library, &mut state).unwrap();

        state.gpr[3] = 0;
        get_sys_fatal_error_handler(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0x1234_5678);
    }

    #[test]
    fn init_graf_sets_up_quickdraw() {
        let (space, mut library) = load();
        let the_port = GuestAddress(library.qd().value() + QD_THE_PORT);
        let mut state = MachineState::new();
        state.gpr[3] = the_port.value();
        init_graf(&mut library, &mut state).unwrap();

        assert_eq!(space.load::<u32>(the_port).unwrap(), library.port().value());
        let black = space
            .read_bytes(GuestAddress(library.qd().value() + QD_BLACK), 8)
            .unwrap();
        assert_eq!(black, vec![0xFF; 8]);
        let gray = space
            .read_bytes(GuestAddress(library.qd().value() + QD_GRAY), 2)
            .unwrap();
        assert_eq!(gray, vec![0xAA, 0x55]);
    }

    #[test]
    fn clocks_move_forward() {
        let (space, mut library) = load();
        let wide = space.allocate(8, "UnsignedWide").unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = wide.value();
        microseconds(&mut library, &mut state).unwrap();
        let first = space.load::<u64>(wide).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        microseconds(&mut library, &mut state).unwrap();
        let second = space.load::<u64>(wide).unwrap();
        assert!(second >= first + 20_000);

        tick_count(&mut library, &mut state).unwrap();
        assert!(state.return_value() >= 1);
    }

    #[test]
    fn ui_calls_need_a_channel() {
        let (space, mut library) = load();
        let record = space.allocate(EVENT_RECORD_SIZE, "EventRecord").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = 0xFFFF;
        state.gpr[4] = record.value();

        assert!(!library.has_channel());
        assert!(matches!(
            get_next_event(&mut library, &mut state),
            Err(Error::ChannelUnavailable)
        ));
        assert!(matches!(
            sys_beep(&mut library, &mut state),
            Err(Error::ChannelUnavailable)
        ));
    }

    #[test]
    fn get_next_event_discards() {
        let (space, mut library) = load();
        let requests = Requests::default();
        let event = key_down_event();
        library.attach_channel(UiChannel::from_pipes(
            responses(&[&event, &[]]),
            requests.clone(),
        ));

        let record = space.allocate(EVENT_RECORD_SIZE, "EventRecord").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = 0x0008;
        state.gpr[4] = record.value();
        get_next_event(&mut library, &mut state).unwrap();

        assert_eq!(state.return_value(), 1);
        assert_eq!(space.read_bytes(record, EVENT_RECORD_SIZE).unwrap(), event.to_vec());

        let mut expected = Vec::new();
        for message in [UiMessage::PeekNextEvent, UiMessage::DiscardNextEvent] {
            expected.extend_from_slice(&message.tag().to_ne_bytes());
            expected.extend_from_slice(&0x0008u16.to_ne_bytes());
            expected.extend_from_slice(b"DONE");
        }
        assert_eq!(*requests.0.lock().unwrap(), expected);
    }

    #[test]
    fn event_avail_peeks_only() {
        let (space, mut library) = load();
        let requests = Requests::default();
        library.attach_channel(UiChannel::from_pipes(
            responses(&[&key_down_event(), &[0u8; EVENT_RECORD_SIZE]]),
            requests.clone(),
        ));

        let record = space.allocate(EVENT_RECORD_SIZE, "EventRecord").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = 0xFFFF;
        state.gpr[4] = record.value();
        event_avail(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 1);
        assert_eq!(requests.0.lock().unwrap().len(), 4 + 2 + 4);

        // A null event reports nothing pending
        event_avail(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        assert!(library.has_channel());
    }

    #[test]
    fn faulted_channel_stays_faulted() {
        let (_space, mut library) = load();
        library.attach_channel(UiChannel::from_pipes(
            Cursor::new(b"NOPE".to_vec()),
            io::sink(),
        ));

        let mut state = MachineState::new();
        assert!(matches!(
            sys_beep(&mut library, &mut state),
            Err(Error::ProtocolFault(_))
        ));
        assert!(!library.has_channel());
        assert!(matches!(
            sys_beep(&mut library, &mut state),
            Err(Error::ProtocolFault(_))
        ));
    }
}
