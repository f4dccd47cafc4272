use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Sink for pipeline events. Stages take one by reference instead of logging
/// globally, so they stay pure and can run on any worker thread.
pub trait Reporter: Send + Sync {
    fn record(&self, severity: Severity, message: &str);
}

/// Forwards everything to `tracing`.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn record(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }
}

#[cfg(test)]
pub use memory::MemoryReporter;

#[cfg(test)]
mod memory {
    use std::sync::Mutex;

    use super::{Reporter, Severity};

    /// Collects entries for assertions.
    #[derive(Default)]
    pub struct MemoryReporter {
        entries: Mutex<Vec<(Severity, String)>>,
    }

    impl MemoryReporter {
        pub fn count(&self, severity: Severity) -> usize {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == severity)
                .count()
        }
    }

    impl Reporter for MemoryReporter {
        fn record(&self, severity: Severity, message: &str) {
            self.entries.lock().unwrap().push((severity, message.to_string()));
        }
    }
}
