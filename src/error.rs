use thiserror::Error;

use crate::container::SectionKind;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

macro_rules! pattern_error {
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedPattern(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Symbol lookups never fail with an error: a symbol that no library exports is reported as
/// [`crate::bridge::SymbolResolution::NotFound`], which the import-binding step handles itself.
///
/// # Error Categories
///
/// ## Container Errors
/// - [`Error::CorruptContainer`] - Header tables or section bytes run past the container
/// - [`Error::UnsupportedSectionType`] - Section kind that cannot be instantiated
/// - [`Error::AlignmentViolation`] - Section alignment below the minimum for its kind
/// - [`Error::InvalidOpcode`] - Unknown pattern-initialization opcode
/// - [`Error::MalformedPattern`] - Pattern stream with wrong byte accounting
/// - [`Error::Section`] - Any of the above, tagged with the offending section
///
/// ## Bridge Errors
/// - [`Error::ProtocolFault`] - RPC sentinel mismatch or unexpected close
/// - [`Error::AllocationFailure`] - The guest allocator ran out of space
/// - [`Error::InvalidAddress`] - Guest address outside any live allocation
///
/// # Examples
///
/// ```rust,no_run
/// use pefrun::{Container, Error};
///
/// match Container::from_file(std::path::Path::new("SimpleText")) {
///     Ok(container) => println!("{} sections", container.sections().len()),
///     Err(Error::Section { index, name, source }) => {
///         eprintln!("section #{index} ({name}) failed: {source}");
///     }
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type is not supported.
    ///
    /// Raised for containers with bad tags, an unknown format version or an
    /// architecture other than PowerPC or 68k.
    #[error("This file type is not supported")]
    NotSupported,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Section or header bytes extend past the end of the container.
    ///
    /// Detected before any section buffer is allocated.
    #[error("Corrupt container - {0}")]
    CorruptContainer(String),

    /// The section kind cannot be instantiated into memory.
    #[error("Section kind {0} cannot be instantiated")]
    UnsupportedSectionType(SectionKind),

    /// The section declares an alignment below the minimum for its kind.
    #[error("Section alignment 2^{exponent} does not satisfy the {required}-byte minimum")]
    AlignmentViolation {
        /// Declared alignment exponent
        exponent: u8,
        /// Minimum alignment in bytes
        required: u32,
    },

    /// A pattern instruction used an opcode outside the defined set.
    #[error("Invalid pattern opcode {opcode} at packed offset {offset}")]
    InvalidOpcode {
        /// The 3-bit opcode
        opcode: u8,
        /// Offset of the instruction byte within the packed data
        offset: usize,
    },

    /// A pattern stream did not consume exactly its packed size or did not produce exactly
    /// its unpacked size.
    #[error("Malformed pattern - {0}")]
    MalformedPattern(String),

    /// Error raised while instantiating one section; aborts the whole container load.
    #[error("Section #{index} ({name}): {source}")]
    Section {
        /// Index of the section in the container's section table
        index: usize,
        /// Section name, or an empty string for unnamed sections
        name: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// The remote-call channel received an unexpected sentinel or was closed mid-call.
    ///
    /// A faulted channel is never reused.
    #[error("Protocol fault - {0}")]
    ProtocolFault(String),

    /// A library tried to delegate to the host UI process but no channel is attached.
    #[error("No host channel is attached to this library")]
    ChannelUnavailable,

    /// The guest allocator could not satisfy a request.
    #[error("Allocation of {requested} bytes failed, {available} bytes available")]
    AllocationFailure {
        /// Requested size in bytes
        requested: usize,
        /// Remaining capacity in bytes
        available: usize,
    },

    /// The guest address does not fall within a live allocation.
    #[error("Guest address 0x{0:08X} is not mapped")]
    InvalidAddress(u32),

    /// No library with this name is registered.
    #[error("Library not found - {0}")]
    LibraryNotFound(String),

    /// The library handle or code entry does not refer to a loaded library.
    #[error("Library handle is not loaded")]
    InvalidHandle,

    /// The guest called `exit`; the execution engine decides how to unwind.
    #[error("Guest exited with status {0}")]
    GuestExit(i32),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}
