//! Capture log events emitted by the code under test.
use std::{fmt, sync::Arc};

use observability_deps::tracing::{
    self,
    field::{Field, Visit},
    subscriber::DefaultGuard,
    Event, Subscriber,
};
use parking_lot::Mutex;
use tracing_subscriber::{layer::Context, prelude::*, Layer};

/// Records every event of the current thread as a `key = value; ` formatted line.
///
/// The capture is registered as the thread-local default subscriber on creation and
/// unregistered when dropped. Tests driven by a current-thread runtime see the events of
/// all their tasks.
#[derive(Debug)]
pub struct TracingCapture {
    lines: Arc<Mutex<Vec<String>>>,
    _guard: DefaultGuard,
}

impl TracingCapture {
    /// Start capturing.
    #[expect(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let layer = CaptureLayer {
            lines: Arc::clone(&lines),
        };
        let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        Self {
            lines,
            _guard: guard,
        }
    }

    /// Captured lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl fmt::Display for TracingCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines().join("\n"))
    }
}

struct CaptureLayer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor {
            line: format!("level = {}; ", event.metadata().level()),
        };
        event.record(&mut visitor);
        self.lines.lock().push(visitor.line);
    }
}

struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.line.push_str(&format!("{} = {value:?}; ", field.name()));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.line.push_str(&format!("{} = {value}; ", field.name()));
    }
}

#[cfg(test)]
mod tests {
    use observability_deps::tracing::{info, warn};

    use super::*;

    #[test]
    fn test_capture() {
        let capture = TracingCapture::new();

        info!(key = "k1", "hello");
        warn!(n = 2, "world");

        let lines = capture.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("level = INFO; "));
        assert!(lines[0].contains("message = hello; "));
        assert!(lines[0].contains("key = k1; "));
        assert!(lines[1].starts_with("level = WARN; "));
        assert!(lines[1].contains("n = 2; "));
        assert_eq!(capture.to_string(), lines.join("\n"));
    }

    #[test]
    fn test_drop_unregisters() {
        let capture = TracingCapture::new();
        info!("before");
        let lines = Arc::clone(&capture.lines);
        drop(capture);

        info!("after");

        assert_eq!(lines.lock().len(), 1);
    }
}
