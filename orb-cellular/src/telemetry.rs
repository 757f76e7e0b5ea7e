//! Logging setup: journald when running under systemd, stderr on a terminal.

use std::io::{IsTerminal as _, Write as _};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Debug)]
pub struct TelemetryConfig {
    syslog_identifier: Option<String>,
    global_filter: EnvFilter,
}

impl TelemetryConfig {
    #[expect(clippy::new_without_default, reason = "may add required args later")]
    #[must_use]
    pub fn new() -> Self {
        Self {
            syslog_identifier: None,
            global_filter: EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        }
    }

    /// Enables journald with the given syslog identifier. Ignored on a tty.
    #[must_use]
    pub fn with_journald(self, syslog_identifier: &str) -> Self {
        Self {
            syslog_identifier: Some(syslog_identifier.to_owned()),
            ..self
        }
    }

    pub fn try_init(self) -> Result<TelemetryFlusher, tracing_subscriber::util::TryInitError> {
        let journald_layer = if !std::io::stderr().is_terminal() {
            self.syslog_identifier.and_then(|syslog_identifier| {
                tracing_journald::layer()
                    .inspect_err(|err| {
                        eprintln!("failed connecting to journald socket. will write to stderr: {err}");
                    })
                    .map(|layer| layer.with_syslog_identifier(syslog_identifier))
                    .ok()
            })
        } else {
            None
        };
        let stderr_layer = journald_layer
            .is_none()
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(journald_layer)
            .with(self.global_filter)
            .try_init()?;

        Ok(TelemetryFlusher { _priv: () })
    }

    /// Panics if a global subscriber is already registered.
    pub fn init(self) -> TelemetryFlusher {
        self.try_init().expect("failed to initialize telemetry")
    }
}

#[must_use = "call .flush at the end of the program, otherwise logs may get lost"]
pub struct TelemetryFlusher {
    _priv: (),
}

impl TelemetryFlusher {
    pub async fn flush(self) {
        std::io::stderr().flush().ok();
        std::io::stdout().flush().ok();
    }
}
