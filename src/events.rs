use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// An explicit level wins over `RUST_LOG`; an unparseable filter falls back to `info`.
pub fn init_logging(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

type EventSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Lifecycle event stream, one JSON object per line.
///
/// `serve --json-output` points it at stderr. Disabled emitters drop
/// everything without serialising.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<EventSink>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        if json_output {
            Self::with_writer(io::stderr())
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        let Some(sink) = &self.sink else {
            return;
        };

        let event = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "type": event_type,
            "payload": payload,
        });
        let Ok(mut out) = sink.lock() else {
            return;
        };
        if let Err(error) = writeln!(out, "{event}").and_then(|()| out.flush()) {
            tracing::debug!(event_type, error = %error, "failed to write lifecycle event");
        }
    }
}
