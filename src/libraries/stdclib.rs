//! `StdCLib`, the classic Mac OS C runtime.
//!
//! The Globals block reproduces the runtime's exported data in guest memory, including the
//! 40-entry `_iob` stream table guest code indexes directly. Host streams never live in guest
//! memory: they are kept in a table indexed by `_iob` slot, and a guest `FILE*` is mapped back
//! to its slot by address.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, BufRead, BufReader, Seek, SeekFrom, Write},
    sync::Arc,
};

use log::debug;

use crate::{
    bridge::{DataExport, Library, LibraryContext, MachineState, Trampoline},
    memory::{AddressSpace, Allocator, GuestAddress},
    Error::GuestExit,
    Result,
};

/// Number of `_iob` stream records.
pub const STREAM_COUNT: usize = 40;
/// Size of one `_iob` record: `_cnt`, `_ptr`, `_base`, `_end`, `_size`, `_flag`, `_file`.
pub const IOB_RECORD_SIZE: u32 = 24;
/// Size of the Globals block.
pub const GLOBALS_SIZE: usize = 1376;
/// Size of a `jmp_buf` written by `__setjmp`, in 32-bit words.
pub const JMP_BUF_WORDS: u32 = 65;

const EOF: i32 = -1;
const ENOENT: u32 = 2;
const EIO: u32 = 5;
const EBADF: u32 = 9;
const EINVAL: u32 = 22;
const EMFILE: u32 = 24;
const ESPIPE: u32 = 29;

mod offsets {
    pub const C_PHASE: u32 = 0;
    pub const LOC: u32 = 4;
    pub const NUB_AT3: u32 = 8;
    pub const P_CTYPE: u32 = 12;
    pub const SIG_ENV: u32 = 16;
    pub const TARGET_FOR_EXIT: u32 = 20;
    pub const YD: u32 = 276;
    pub const CATEGORY_LOC: u32 = 280;
    pub const DBL_EPSILON: u32 = 288;
    pub const DBL_MAX: u32 = 296;
    pub const DBL_MIN: u32 = 304;
    pub const EXIT_STATUS: u32 = 312;
    pub const FLT_EPSILON: u32 = 320;
    pub const FLT_MAX: u32 = 328;
    pub const FLT_MIN: u32 = 336;
    pub const INT_ENV: u32 = 344;
    pub const IOB: u32 = 348;
    pub const LASTBUF: u32 = 1308;
    pub const LDBL_EPSILON: u32 = 1312;
    pub const LDBL_MIN: u32 = 1320;
    pub const LDBL_MAX: u32 = 1328;
    pub const PUBLIC_TIME_INFO: u32 = 1336;
    pub const STD_DEVS: u32 = 1340;
    pub const ERRNO: u32 = 1344;
    pub const MAC_OS_ERR: u32 = 1348;
    pub const MONEY_DATA: u32 = 1352;
    pub const NO_MORE_DEBUG_STR: u32 = 1356;
    pub const NUMERIC_DATA: u32 = 1360;
    pub const STAND_ALONE: u32 = 1364;
    pub const TIME_DATA: u32 = 1368;
}

// `_iob` record fields
const IOB_FILE: u32 = 20;

enum HostStream {
    Stdin,
    Stdout,
    Stderr,
    File {
        inner: BufReader<fs::File>,
        readable: bool,
        writable: bool,
    },
}

impl HostStream {
    fn open(path: &str, mode: &str) -> io::Result<HostStream> {
        let mut options = OpenOptions::new();
        let update = mode.contains('+');
        let (readable, writable) = match mode.chars().next() {
            Some('r') => {
                options.read(true).write(update);
                (true, update)
            }
            Some('w') => {
                options.write(true).read(update).create(true).truncate(true);
                (update, true)
            }
            Some('a') => {
                options.append(true).read(update).create(true);
                (update, true)
            }
            _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        };

        Ok(HostStream::File {
            inner: BufReader::new(options.open(path)?),
            readable,
            writable,
        })
    }

    fn read_line(&mut self, max: usize) -> io::Result<Vec<u8>> {
        match self {
            HostStream::Stdin => read_line(&mut io::stdin().lock(), max),
            HostStream::File {
                inner,
                readable: true,
                ..
            } => read_line(inner, max),
            _ => Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            HostStream::Stdout => io::stdout().write_all(data),
            HostStream::Stderr => io::stderr().write_all(data),
            HostStream::File {
                inner,
                writable: true,
                ..
            } => {
                // Drop read-ahead so the write lands at the logical position
                inner.seek(SeekFrom::Current(0))?;
                inner.get_mut().write_all(data)
            }
            _ => Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        }
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        match self {
            HostStream::File { inner, .. } => inner.seek(position),
            _ => Err(io::Error::from_raw_os_error(ESPIPE as i32)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            HostStream::Stdout => io::stdout().flush(),
            HostStream::Stderr => io::stderr().flush(),
            _ => Ok(()),
        }
    }
}

fn read_line(reader: &mut impl BufRead, max: usize) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    while line.len() < max {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }

        let wanted = (max - line.len()).min(available.len());
        if let Some(newline) = available[..wanted].iter().position(|byte| *byte == b'\n') {
            line.extend_from_slice(&available[..=newline]);
            reader.consume(newline + 1);
            break;
        }

        line.extend_from_slice(&available[..wanted]);
        reader.consume(wanted);
    }
    Ok(line)
}

fn errno_of(error: &io::Error) -> u32 {
    match (error.raw_os_error(), error.kind()) {
        (Some(code), _) => u32::try_from(code).unwrap_or(EIO),
        (None, io::ErrorKind::NotFound) => ENOENT,
        (None, io::ErrorKind::InvalidInput) => EINVAL,
        (None, io::ErrorKind::PermissionDenied) => EBADF,
        _ => EIO,
    }
}

/// Host implementation of `StdCLib`.
pub struct StdCLib {
    space: Arc<AddressSpace>,
    globals: GuestAddress,
    streams: Vec<Option<HostStream>>,
    environment: HashMap<String, GuestAddress>,
}

impl StdCLib {
    /// Guest address of the Globals block.
    #[must_use]
    pub fn globals(&self) -> GuestAddress {
        self.globals
    }

    /// Guest address of `_iob[slot]`, the guest's `FILE*` for that stream.
    #[must_use]
    pub fn iob_address(&self, slot: usize) -> GuestAddress {
        self.field(offsets::IOB + slot as u32 * IOB_RECORD_SIZE)
    }

    /// Current value of the guest's `errno`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidAddress`] if the Globals block is gone.
    pub fn errno(&self) -> Result<u32> {
        self.space.load(self.field(offsets::ERRNO))
    }

    fn field(&self, offset: u32) -> GuestAddress {
        GuestAddress(self.globals.value() + offset)
    }

    fn set_errno(&self, value: u32) -> Result<()> {
        self.space.store(self.field(offsets::ERRNO), value)
    }

    fn slot_of(&self, file: GuestAddress) -> Option<usize> {
        let offset = file.value().checked_sub(self.iob_address(0).value())?;
        if offset % IOB_RECORD_SIZE != 0 {
            return None;
        }

        let slot = (offset / IOB_RECORD_SIZE) as usize;
        (slot < STREAM_COUNT).then_some(slot)
    }

    fn stream(&mut self, file: GuestAddress) -> Option<&mut HostStream> {
        let slot = self.slot_of(file)?;
        self.streams[slot].as_mut()
    }

    fn attach(&mut self, slot: usize, stream: HostStream) -> Result<()> {
        let record = self.iob_address(slot);
        self.space.fill(record, 0, IOB_RECORD_SIZE as usize)?;
        self.space
            .store(GuestAddress(record.value() + IOB_FILE), slot as u16)?;
        self.streams[slot] = Some(stream);
        Ok(())
    }

    /// Write `data` to the stream behind `file`, returning the C-level result.
    fn write_stream(&mut self, file: GuestAddress, data: &[u8]) -> Result<std::result::Result<(), u32>> {
        let outcome = match self.stream(file) {
            Some(stream) => stream.write_all(data).map_err(|error| errno_of(&error)),
            None => Err(EBADF),
        };
        if let Err(errno) = outcome {
            self.set_errno(errno)?;
        }
        Ok(outcome)
    }
}

impl Library for StdCLib {
    const NAME: &'static str = "StdCLib";

    fn load(context: &LibraryContext) -> Result<Self> {
        let space = context.space.clone();
        let globals = space.allocate(GLOBALS_SIZE, "StdCLib Globals")?;

        let mut library = StdCLib {
            space,
            globals,
            streams: (0..STREAM_COUNT).map(|_| None).collect(),
            environment: HashMap::new(),
        };

        let limits = [
            (offsets::DBL_EPSILON, f64::EPSILON),
            (offsets::DBL_MAX, f64::MAX),
            (offsets::DBL_MIN, f64::MIN_POSITIVE),
            (offsets::FLT_EPSILON, f64::from(f32::EPSILON)),
            (offsets::FLT_MAX, f64::from(f32::MAX)),
            (offsets::FLT_MIN, f64::from(f32::MIN_POSITIVE)),
            (offsets::LDBL_EPSILON, f64::EPSILON),
            (offsets::LDBL_MIN, f64::MIN_POSITIVE),
            (offsets::LDBL_MAX, f64::MAX),
        ];
        for (offset, value) in limits {
            library.space.store(library.field(offset), value)?;
        }

        library.attach(0, HostStream::Stdin)?;
        library.attach(1, HostStream::Stdout)?;
        library.attach(2, HostStream::Stderr)?;

        Ok(library)
    }

    fn trampolines() -> &'static [(&'static str, Trampoline<Self>)] {
        TRAMPOLINES
    }

    fn data_exports() -> &'static [DataExport<Self>] {
        DATA_EXPORTS
    }

    fn unload(mut self) -> Result<()> {
        for stream in self.streams.iter_mut().flatten() {
            if let Err(error) = stream.flush() {
                debug!("Flushing guest stream failed: {error}");
            }
        }
        self.streams.clear();

        let mut result = Ok(());
        for (_, address) in self.environment.drain() {
            if let Err(error) = self.space.deallocate(address) {
                result = result.and(Err(error));
            }
        }

        self.space.deallocate(self.globals).and(result)
    }
}

static TRAMPOLINES: &[(&str, Trampoline<StdCLib>)] = &[
    ("StdCLib___setjmp", setjmp),
    ("StdCLib_exit", exit),
    ("StdCLib_faccess", faccess),
    ("StdCLib_fclose", fclose),
    ("StdCLib_fgets", fgets),
    ("StdCLib_fopen", fopen),
    ("StdCLib_fprintf", fprintf),
    ("StdCLib_fputs", fputs),
    ("StdCLib_fseek", fseek),
    ("StdCLib_getenv", getenv),
    ("StdCLib_memcmp", memcmp),
    ("StdCLib_memcpy", memcpy),
    ("StdCLib_memset", memset),
    ("StdCLib_printf", printf),
    ("StdCLib_puts", puts),
    ("StdCLib_strcmp", strcmp),
    ("StdCLib_strcpy", strcpy),
    ("StdCLib_strlen", strlen),
    ("StdCLib_strrchr", strrchr),
    ("StdCLib_tolower", tolower),
    ("StdCLib_toupper", toupper),
];

macro_rules! data_exports {
    ($($name:literal => $offset:expr),* $(,)?) => {
        &[$(DataExport {
            name: $name,
            accessor: |library: &StdCLib| library.field($offset),
        }),*]
    };
}

static DATA_EXPORTS: &[DataExport<StdCLib>] = data_exports![
    "__C_phase" => offsets::C_PHASE,
    "__loc" => offsets::LOC,
    "__NubAt3" => offsets::NUB_AT3,
    "__p_CType" => offsets::P_CTYPE,
    "__SigEnv" => offsets::SIG_ENV,
    "__target_for_exit" => offsets::TARGET_FOR_EXIT,
    "__yd" => offsets::YD,
    "_CategoryLoc" => offsets::CATEGORY_LOC,
    "_DBL_EPSILON" => offsets::DBL_EPSILON,
    "_DBL_MAX" => offsets::DBL_MAX,
    "_DBL_MIN" => offsets::DBL_MIN,
    "_exit_status" => offsets::EXIT_STATUS,
    "_FLT_EPSILON" => offsets::FLT_EPSILON,
    "_FLT_MAX" => offsets::FLT_MAX,
    "_FLT_MIN" => offsets::FLT_MIN,
    "_IntEnv" => offsets::INT_ENV,
    "_iob" => offsets::IOB,
    "_lastbuf" => offsets::LASTBUF,
    "_LDBL_EPSILON" => offsets::LDBL_EPSILON,
    "_LDBL_MIN" => offsets::LDBL_MIN,
    "_LDBL_MAX" => offsets::LDBL_MAX,
    "_PublicTimeInfo" => offsets::PUBLIC_TIME_INFO,
    "_StdDevs" => offsets::STD_DEVS,
    "errno" => offsets::ERRNO,
    "MacOSErr" => offsets::MAC_OS_ERR,
    "MoneyData" => offsets::MONEY_DATA,
    "NoMoreDebugStr" => offsets::NO_MORE_DEBUG_STR,
    "NumericData" => offsets::NUMERIC_DATA,
    "StandAlone" => offsets::STAND_ALONE,
    "TimeData" => offsets::TIME_DATA,
];

fn setjmp(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let mut words = Vec::with_capacity(JMP_BUF_WORDS as usize * 4);
    let mut push = |word: u32| words.extend_from_slice(&word.to_be_bytes());

    push(state.lr);
    push(state.cr);
    push(state.gpr[1]);
    push(state.gpr[2]);
    push(0);
    for gpr in &state.gpr[13..32] {
        push(*gpr);
    }
    for fpr in &state.fpr[14..32] {
        let bits = fpr.to_bits();
        push((bits >> 32) as u32);
        push(bits as u32);
    }
    while words.len() < JMP_BUF_WORDS as usize * 4 {
        words.extend_from_slice(&[0; 4]);
    }

    library.space.write_bytes(state.arg_address(0), &words)?;
    state.set_return(0);
    library.set_errno(0)
}

fn exit(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let status = state.arg(0);
    library
        .space
        .store(library.field(offsets::EXIT_STATUS), status)?;
    for stream in library.streams.iter_mut().flatten() {
        if let Err(error) = stream.flush() {
            debug!("Flushing guest stream failed: {error}");
        }
    }

    Err(GuestExit(status as i32))
}

fn faccess(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let path = library.space.read_string(state.arg_address(0))?;
    debug!("faccess({path}, 0x{:08X}) accepted", state.arg(1));
    state.set_return(0);
    library.set_errno(0)
}

fn fopen(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let path = library.space.read_string(state.arg_address(0))?;
    let mode = library.space.read_string(state.arg_address(1))?;

    let Some(slot) = library.streams.iter().position(Option::is_none) else {
        state.set_return(0);
        return library.set_errno(EMFILE);
    };

    match HostStream::open(&path, &mode) {
        Ok(stream) => {
            library.attach(slot, stream)?;
            state.set_return(library.iob_address(slot).value());
            library.set_errno(0)
        }
        Err(error) => {
            debug!("fopen({path}, {mode}) failed: {error}");
            state.set_return(0);
            library.set_errno(errno_of(&error))
        }
    }
}

fn fclose(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let file = state.arg_address(0);
    let Some(slot) = library.slot_of(file) else {
        state.set_return_signed(EOF);
        return library.set_errno(EBADF);
    };

    match library.streams[slot].take() {
        Some(mut stream) => {
            library.space.fill(file, 0, IOB_RECORD_SIZE as usize)?;
            match stream.flush() {
                Ok(()) => state.set_return(0),
                Err(error) => {
                    state.set_return_signed(EOF);
                    library.set_errno(errno_of(&error))?;
                }
            }
            Ok(())
        }
        None => {
            state.set_return_signed(EOF);
            library.set_errno(EBADF)
        }
    }
}

fn fgets(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let buffer = state.arg_address(0);
    let size = state.arg(1) as i32;
    let file = state.arg_address(2);

    if size <= 0 {
        state.set_return(0);
        return Ok(());
    }

    // Room for the terminator only: store an empty string without reading
    let max = size as usize - 1;
    let line = match library.stream(file) {
        Some(_) if max == 0 => Ok(Vec::new()),
        Some(stream) => stream.read_line(max),
        None => {
            state.set_return(0);
            return library.set_errno(EBADF);
        }
    };

    match line {
        Ok(line) if line.is_empty() && max > 0 => state.set_return(0),
        Ok(line) => {
            library.space.write_cstring(buffer, &line)?;
            state.set_return(buffer.value());
        }
        Err(error) => {
            state.set_return(0);
            library.set_errno(errno_of(&error))?;
        }
    }
    Ok(())
}

fn fputs(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let text = library.space.read_cstring(state.arg_address(0))?;
    match library.write_stream(state.arg_address(1), &text)? {
        Ok(()) => state.set_return(0),
        Err(_) => state.set_return_signed(EOF),
    }
    Ok(())
}

// Formatting is not interpreted; the format string is written as is.
fn fprintf(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let format = library.space.read_cstring(state.arg_address(1))?;
    match library.write_stream(state.arg_address(0), &format)? {
        Ok(()) => state.set_return(format.len() as u32),
        Err(_) => state.set_return_signed(-1),
    }
    Ok(())
}

// Same as `puts` on the format string, trailing newline included.
fn printf(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    puts(library, state)
}

fn puts(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let mut text = library.space.read_cstring(state.arg_address(0))?;
    text.push(b'\n');
    let stdout = library.iob_address(1);
    match library.write_stream(stdout, &text)? {
        Ok(()) => state.set_return(0),
        Err(_) => state.set_return_signed(EOF),
    }
    Ok(())
}

fn fseek(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let offset = i64::from(state.arg(1) as i32);
    let position = match state.arg(2) {
        0 => u64::try_from(offset).ok().map(SeekFrom::Start),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    };

    let outcome = match (position, library.stream(state.arg_address(0))) {
        (_, None) => Err(EBADF),
        (None, Some(_)) => Err(EINVAL),
        (Some(position), Some(stream)) => {
            stream.seek(position).map(|_| ()).map_err(|error| errno_of(&error))
        }
    };

    match outcome {
        Ok(()) => state.set_return(0),
        Err(errno) => {
            state.set_return_signed(-1);
            library.set_errno(errno)?;
        }
    }
    Ok(())
}

fn getenv(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let name = library.space.read_string(state.arg_address(0))?;
    let Some(value) = std::env::var_os(&name) else {
        state.set_return(0);
        return Ok(());
    };

    let value = value.to_string_lossy();
    if let Some(previous) = library.environment.remove(&name) {
        library.space.deallocate(previous)?;
    }
    let address = library.space.allocate_cstring(&value)?;
    library.environment.insert(name, address);
    state.set_return(address.value());
    Ok(())
}

fn memcmp(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let size = state.arg(2) as usize;
    let left = library.space.read_bytes(state.arg_address(0), size)?;
    let right = library.space.read_bytes(state.arg_address(1), size)?;
    state.set_return_signed(compare(&left, &right));
    Ok(())
}

fn memcpy(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let destination = state.arg_address(0);
    library
        .space
        .copy(destination, state.arg_address(1), state.arg(2) as usize)?;
    state.set_return(destination.value());
    Ok(())
}

fn memset(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let destination = state.arg_address(0);
    library
        .space
        .fill(destination, state.arg(1) as u8, state.arg(2) as usize)?;
    state.set_return(destination.value());
    Ok(())
}

fn strcmp(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let mut left = library.space.read_cstring(state.arg_address(0))?;
    let mut right = library.space.read_cstring(state.arg_address(1))?;
    left.push(0);
    right.push(0);
    state.set_return_signed(compare(&left, &right));
    Ok(())
}

fn strcpy(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let destination = state.arg_address(0);
    let source = library.space.read_cstring(state.arg_address(1))?;
    library.space.write_cstring(destination, &source)?;
    state.set_return(destination.value());
    Ok(())
}

fn strlen(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let text = library.space.read_cstring(state.arg_address(0))?;
    state.set_return(text.len() as u32);
    Ok(())
}

fn strrchr(library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let text_address = state.arg_address(0);
    let text = library.space.read_cstring(text_address)?;
    let wanted = state.arg(1) as u8;

    let position = if wanted == 0 {
        Some(text.len())
    } else {
        text.iter().rposition(|byte| *byte == wanted)
    };

    state.set_return(position.map_or(0, |position| text_address.value() + position as u32));
    Ok(())
}

fn tolower(_library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let value = state.arg(0);
    if let Ok(byte) = u8::try_from(value) {
        state.set_return(u32::from(byte.to_ascii_lowercase()));
    }
    Ok(())
}

fn toupper(_library: &mut StdCLib, state: &mut MachineState) -> Result<()> {
    let value = state.arg(0);
    if let Ok(byte) = u8::try_from(value) {
        state.set_return(u32::from(byte.to_ascii_uppercase()));
    }
    Ok(())
}

fn compare(left: &[u8], right: &[u8]) -> i32 {
    left.iter()
        .zip(right)
        .find(|(a, b)| a != b)
        .map_or(0, |(a, b)| i32::from(*a) - i32::from(*b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bridge::LibrarySymbol, test::address_space, Error};

    fn load() -> (Arc<AddressSpace>, StdCLib) {
        let space = address_space();
        let library = StdCLib::load(&LibraryContext::new(space.clone())).unwrap();
        (space, library)
    }

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("pefrun_stdclib_{}_{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn globals_layout() {
        let (space, library) = load();
        assert_eq!(
            library.lookup("errno"),
            LibrarySymbol::Data(GuestAddress(library.globals().value() + 1344))
        );
        assert_eq!(
            library.lookup("_iob"),
            LibrarySymbol::Data(library.iob_address(0))
        );
        assert!(matches!(library.lookup("strlen"), LibrarySymbol::Code(_)));
        assert_eq!(library.lookup("qsort"), LibrarySymbol::NotFound);
        assert_eq!(library.lookup("StdCLib_strlen"), LibrarySymbol::NotFound);

        let LibrarySymbol::Data(epsilon) = library.lookup("_DBL_EPSILON") else {
            panic!("_DBL_EPSILON should be data");
        };
        assert_eq!(space.load::<f64>(epsilon).unwrap(), f64::EPSILON);

        // stdout is _iob[1] and knows its descriptor
        let stdout_file = library.iob_address(1).offset(IOB_FILE as usize).unwrap();
        assert_eq!(space.load::<u16>(stdout_file).unwrap(), 1);
    }

    #[test]
    fn string_functions() {
        let (space, mut library) = load();
        let hello = space.allocate_cstring("Hello, World").unwrap();
        let other = space.allocate_cstring("Hello, there").unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = hello.value();
        strlen(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 12);

        state.gpr[3] = hello.value();
        state.gpr[4] = u32::from(b'o');
        strrchr(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), hello.value() + 8);

        state.gpr[3] = hello.value();
        state.gpr[4] = u32::from(b'z');
        strrchr(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);

        state.gpr[3] = hello.value();
        state.gpr[4] = other.value();
        strcmp(&mut library, &mut state).unwrap();
        assert!((state.return_value() as i32) < 0);

        state.gpr[3] = hello.value();
        state.gpr[4] = other.value();
        state.gpr[5] = 7;
        memcmp(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);

        let buffer = space.allocate(32, "buffer").unwrap();
        state.gpr[3] = buffer.value();
        state.gpr[4] = hello.value();
        strcpy(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), buffer.value());
        assert_eq!(space.read_string(buffer).unwrap(), "Hello, World");

        state.gpr[3] = buffer.value();
        state.gpr[4] = u32::from(b'-');
        state.gpr[5] = 5;
        memset(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "-----, World");

        state.gpr[3] = buffer.value();
        state.gpr[4] = other.value();
        state.gpr[5] = 5;
        memcpy(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "Hello, World");

        state.gpr[3] = u32::from(b'Q');
        tolower(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), u32::from(b'q'));
        toupper(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), u32::from(b'Q'));
        state.gpr[3] = u32::MAX;
        tolower(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), u32::MAX);
    }

    #[test]
    fn unmapped_pointer_is_an_error() {
        let (_space, mut library) = load();
        let mut state = MachineState::new();
        state.gpr[3] = 0x10;
        assert!(matches!(
            strlen(&mut library, &mut state),
            Err(Error::InvalidAddress(0x10))
        ));
    }

    #[test]
    fn file_round_trip() {
        let (space, mut library) = load();
        let path = temp_path("round_trip.txt");
        let path_address = space.allocate_cstring(&path).unwrap();
        let write_mode = space.allocate_cstring("w").unwrap();
        let read_mode = space.allocate_cstring("r").unwrap();
        let text = space.allocate_cstring("first line\nsecond").unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = path_address.value();
        state.gpr[4] = write_mode.value();
        fopen(&mut library, &mut state).unwrap();
        let file = state.arg_address(0);
        assert_eq!(file, library.iob_address(3));

        state.gpr[3] = file.value();
        state.gpr[4] = text.value();
        fprintf(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 17);

        state.gpr[3] = file.value();
        fclose(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);

        state.gpr[3] = path_address.value();
        state.gpr[4] = read_mode.value();
        fopen(&mut library, &mut state).unwrap();
        let file = state.arg_address(0);

        let buffer = space.allocate(64, "line").unwrap();
        state.gpr[3] = buffer.value();
        state.gpr[4] = 64;
        state.gpr[5] = file.value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), buffer.value());
        assert_eq!(space.read_string(buffer).unwrap(), "first line\n");

        // Size includes the terminator
        state.gpr[3] = buffer.value();
        state.gpr[4] = 4;
        state.gpr[5] = file.value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "sec");

        state.gpr[3] = file.value();
        state.gpr[4] = 0;
        state.gpr[5] = 0;
        fseek(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);

        state.gpr[3] = buffer.value();
        state.gpr[4] = 64;
        state.gpr[5] = file.value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "first line\n");
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "second");
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);

        state.gpr[3] = file.value();
        fclose(&mut library, &mut state).unwrap();
        fclose(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value() as i32, EOF);
        assert_eq!(library.errno().unwrap(), EBADF);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn printf_writes_a_line_to_stdout() {
        let (space, mut library) = load();
        let path = temp_path("stdout.txt");
        library.streams[1] = Some(HostStream::open(&path, "w+").unwrap());
        let hello = space.allocate_cstring("hello %d").unwrap();
        let world = space.allocate_cstring("world").unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = hello.value();
        printf(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        state.gpr[3] = world.value();
        puts(&mut library, &mut state).unwrap();

        library.streams[1] = None;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello %d\nworld\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn fgets_with_room_for_the_terminator_only() {
        let (space, mut library) = load();
        let path = temp_path("short_buffer.txt");
        std::fs::write(&path, "abc\n").unwrap();
        library.streams[1] = Some(HostStream::open(&path, "r").unwrap());
        let buffer = space.allocate(8, "line").unwrap();
        space.fill(buffer, b'x', 8).unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = buffer.value();
        state.gpr[4] = 1;
        state.gpr[5] = library.iob_address(1).value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), buffer.value());
        assert_eq!(space.read_string(buffer).unwrap(), "");

        // Nothing was consumed
        state.gpr[3] = buffer.value();
        state.gpr[4] = 8;
        state.gpr[5] = library.iob_address(1).value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(space.read_string(buffer).unwrap(), "abc\n");

        state.gpr[3] = buffer.value();
        state.gpr[4] = 1;
        state.gpr[5] = library.iob_address(7).value();
        fgets(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        assert_eq!(library.errno().unwrap(), EBADF);

        library.streams[1] = None;
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn fopen_failures() {
        let (space, mut library) = load();
        let missing = space
            .allocate_cstring("/nonexistent/pefrun/missing.txt")
            .unwrap();
        let mode = space.allocate_cstring("r").unwrap();
        let mut state = MachineState::new();

        state.gpr[3] = missing.value();
        state.gpr[4] = mode.value();
        fopen(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        assert_eq!(library.errno().unwrap(), ENOENT);

        // A FILE* that is not an _iob record
        state.gpr[3] = library.iob_address(0).value() + 2;
        fclose(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value() as i32, EOF);
        assert_eq!(library.errno().unwrap(), EBADF);
    }

    #[test]
    fn stream_table_exhaustion() {
        let (space, mut library) = load();
        let path = temp_path("exhaustion.txt");
        let path_address = space.allocate_cstring(&path).unwrap();
        let mode = space.allocate_cstring("w").unwrap();
        let mut state = MachineState::new();

        for _ in 3..STREAM_COUNT {
            state.gpr[3] = path_address.value();
            state.gpr[4] = mode.value();
            fopen(&mut library, &mut state).unwrap();
            assert_ne!(state.return_value(), 0);
        }

        state.gpr[3] = path_address.value();
        state.gpr[4] = mode.value();
        fopen(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        assert_eq!(library.errno().unwrap(), EMFILE);

        library.unload().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn setjmp_layout() {
        let (space, mut library) = load();
        let jmp_buf = space.allocate(JMP_BUF_WORDS as usize * 4, "jmp_buf").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = jmp_buf.value();
        state.lr = 0x1000_2000;
        state.cr = 0x2200_0000;
        state.gpr[1] = 0x7FFF_0000;
        state.gpr[13] = 13;
        state.gpr[31] = 31;
        state.fpr[14] = 1.5;

        setjmp(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
        assert_eq!(library.errno().unwrap(), 0);

        let word = |index: usize| space.load::<u32>(jmp_buf.offset(index * 4).unwrap()).unwrap();
        assert_eq!(word(0), 0x1000_2000);
        assert_eq!(word(1), 0x2200_0000);
        assert_eq!(word(2), 0x7FFF_0000);
        assert_eq!(word(5), 13);
        assert_eq!(word(23), 31);
        assert_eq!(space.load::<f64>(jmp_buf.offset(24 * 4).unwrap()).unwrap(), 1.5);
        assert_eq!(word(64), 0);
    }

    #[test]
    fn exit_surfaces_status() {
        let (space, mut library) = load();
        let mut state = MachineState::new();
        state.gpr[3] = 3;
        assert!(matches!(
            exit(&mut library, &mut state),
            Err(Error::GuestExit(3))
        ));

        let LibrarySymbol::Data(status) = library.lookup("_exit_status") else {
            panic!("_exit_status should be data");
        };
        assert_eq!(space.load::<u32>(status).unwrap(), 3);
    }

    #[test]
    fn getenv_copies_into_guest_memory() {
        let (space, mut library) = load();
        let name = space.allocate_cstring("PATH").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = name.value();
        getenv(&mut library, &mut state).unwrap();

        match std::env::var("PATH") {
            Ok(path) => assert_eq!(space.read_string(state.arg_address(0)).unwrap(), path),
            Err(_) => assert_eq!(state.return_value(), 0),
        }

        let missing = space
            .allocate_cstring("PEFRUN_SURELY_UNSET_VARIABLE")
            .unwrap();
        state.gpr[3] = missing.value();
        getenv(&mut library, &mut state).unwrap();
        assert_eq!(state.return_value(), 0);
    }

    #[test]
    fn unload_frees_globals() {
        let (space, library) = load();
        let before = space.allocation_count().unwrap();
        library.unload().unwrap();
        assert_eq!(space.allocation_count().unwrap(), before - 1);
    }
}
