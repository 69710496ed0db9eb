//! Diagnostic trace sink.
//!
//! The pod emits one-line trace records for lifecycle transitions, context
//! switches and fatal events. Records go to a sink function registered by
//! the hosting environment; with no sink installed, tracing is silent.

use portable_atomic::{AtomicPtr, Ordering};

/// Sink signature: receives one formatted trace line.
pub type TraceSink = fn(&str);

static TRACE_SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the process-wide trace sink.
pub fn set_trace_sink(sink: TraceSink) {
    TRACE_SINK.store(sink as *mut (), Ordering::Release);
}

/// Remove the trace sink, silencing diagnostics.
pub fn clear_trace_sink() {
    TRACE_SINK.store(core::ptr::null_mut(), Ordering::Release);
}

#[doc(hidden)]
pub fn emit(args: core::fmt::Arguments<'_>) {
    let ptr = TRACE_SINK.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // Only ever stored from a fn(&str), so the transmute is sound.
    let sink: TraceSink = unsafe { core::mem::transmute::<*mut (), TraceSink>(ptr) };
    let line = alloc::format!("{}", args);
    sink(&line);
}

/// Emit a trace record through the registered sink.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::trace::emit(core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_without_sink() {
        clear_trace_sink();
        // Must not panic or allocate a sink.
        crate::trace!("tick {}", 1);
    }
}
