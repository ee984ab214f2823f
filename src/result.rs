//! The snapshot engine uses `Result`s with a small error type, and
//! relies on tracing to record where a failure came from and how it
//! propagated.  The only structured information an `Error` carries is
//! its `ErrorKind`, which decides how the failure is handled: a
//! request-local error completes one request, while anything that
//! breaks copy-before-overwrite invalidates the snapshot.
pub use tracing::Level;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Emit a backtrace whenever we capture an errors at least as severe
/// as BACKTRACE_SEVERITY.
const BACKTRACE_SEVERITY: Level = Level::ERROR;

/// Broad classes of failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Bad target arguments, device open failures, malformed metadata.
    Config,
    /// The exception store can't allocate another chunk.
    NoSpace,
    /// Read or write failure, including copy and commit failures.
    Io,
    /// The snapshot is invalid, or not resumed yet.
    Invalid,
    /// The request falls outside the device or straddles a chunk.
    OutOfRange,
    Other,
}

/// An `Error` is a lightweight struct that relies on the `tracing` crate
/// to stitch up context together after an error.
#[derive(Clone, Debug)]
pub struct Error {
    // The uuid for the initial ("root") error.
    initial_id: Uuid,
    kind: ErrorKind,
    pub message: &'static str,
}

impl Error {
    /// Creates a new `Error` struct; this constructor should only
    /// be called via the macros.
    #[inline(always)]
    pub fn new(initial_id: Uuid, kind: ErrorKind, message: &'static str) -> Self {
        Error {
            initial_id,
            kind,
            message,
        }
    }

    /// Returns `self` with its kind replaced by `kind`.
    #[inline(always)]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline(always)]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the uuid of the error at the root of this chain.
    #[inline(always)]
    pub fn initial_id(&self) -> Uuid {
        self.initial_id
    }

    /// Converts `self` to a `std::io::Error`.
    pub fn to_io(&self) -> std::io::Error {
        use std::io::ErrorKind as IoKind;

        let kind = match self.kind {
            ErrorKind::Config | ErrorKind::OutOfRange => IoKind::InvalidInput,
            ErrorKind::NoSpace | ErrorKind::Io | ErrorKind::Invalid | ErrorKind::Other => {
                IoKind::Other
            }
        };

        std::io::Error::new(kind, self.message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// Only exported for macro use
///
/// Computes a backtrace if `level` is severe enough.
#[inline(always)]
pub fn __maybe_compute_backtrace(level: Level) -> Option<backtrace::Backtrace> {
    if level > BACKTRACE_SEVERITY {
        return None;
    }

    Some(backtrace::Backtrace::new())
}

/// Only exported for macro use.
///
/// If `T == Error`, returns `x`'s `initial_id`, its kind, and
/// `(None, None)`.  Otherwise, returns a fresh uuid, the kind implied
/// by `T` (`Io` for `std::io::Error`), `x`, and potentially a
/// backtrace.
#[inline(always)]
pub fn __extract_cause_info<T: std::any::Any>(
    x: T,
    level: Level,
) -> (Uuid, ErrorKind, Option<T>, Option<backtrace::Backtrace>) {
    use std::any::Any;

    if let Some(as_error) = (&x as &dyn Any).downcast_ref::<Error>() {
        return (as_error.initial_id, as_error.kind, None, None);
    }

    let kind = if (&x as &dyn Any).is::<std::io::Error>() {
        ErrorKind::Io
    } else {
        ErrorKind::Other
    };

    (Uuid::new_v4(), kind, Some(x), __maybe_compute_backtrace(level))
}

/// If `value` evaluates to `Err`, matches the error payload against
/// the patterns, evaluates the corresponding handling expression, and
/// drops the result.
#[macro_export]
macro_rules! drop_result {
    ($value:expr, $($($pattern:pat)|+ $(if $guard:expr)? => $handler:expr),+) => {
        if let Err(name) = $value {
            match name {
                $($($pattern)|+ $(if $guard)? => { let _ = $handler; }),+
            }
        }
    };
}

/// Returns a fresh `Error` struct of kind `Other`, after tracing it
/// at level `level`, with `message` and additional fields passed as a
/// `tracing::event`.
#[macro_export]
macro_rules! fresh {
    ($level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, $crate::result::ErrorKind::Other, message);

        tracing::event!(LEVEL, %root_id, ?bt, $message);
        ret
    }};
    ($level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, $crate::result::ErrorKind::Other, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! fresh_error {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_warn {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_info {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_debug {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::DEBUG, $($message_and_fields)+) };
}

/// Returns an `Error` struct derived from `initial`, after tracing it
/// at level `level`, with `message` and additional fields passed as a
/// `tracing::event`.  The new error keeps `initial`'s root id and kind.
#[macro_export]
macro_rules! chain {
    ($initial:expr, $level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, kind, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, kind, message);

        tracing::event!(LEVEL, %root_id, ?cause, ?bt, $message);
        ret
    }};
    ($initial:expr, $level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, kind, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, kind, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, ?cause, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! chain_error {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_warn {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_info {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_debug {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::DEBUG, $($message_and_fields)+) };
}

#[test]
fn test_chain_keeps_root() {
    let root = fresh_warn!("root failure", answer = 42).with_kind(ErrorKind::NoSpace);
    let chained = chain_debug!(root.clone(), "while doing something else");

    assert_eq!(chained.initial_id(), root.initial_id());
    assert_eq!(chained.kind(), ErrorKind::NoSpace);
    assert_eq!(chained.message, "while doing something else");
}

#[test]
fn test_chain_io_error() {
    let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
    let chained = chain_info!(io, "failed to read sector", sector = 8);

    assert_eq!(chained.kind(), ErrorKind::Io);
    assert_eq!(chained.to_io().kind(), std::io::ErrorKind::Other);
}

#[test]
fn test_fresh_ids_differ() {
    let first = fresh_debug!("first");
    let second = fresh_debug!("second").with_kind(ErrorKind::OutOfRange);

    assert_ne!(first.initial_id(), second.initial_id());
    assert_eq!(first.kind(), ErrorKind::Other);
    assert_eq!(second.to_io().kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn test_drop_result() {
    let mut seen = None;

    drop_result!(Err::<(), Error>(fresh_debug!("ignored").with_kind(ErrorKind::Io)),
                 e if e.kind() == ErrorKind::Io => { seen = Some(e.message); },
                 e => chain_warn!(e, "unexpected kind"));
    assert_eq!(seen, Some("ignored"));
}
