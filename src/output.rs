use std::io::{self, Write};

use serde::Serialize;
use tracing::{debug, info};

use crate::app::{BuildSummary, ProgressEvent, ProgressSink};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &BuildSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None if event.message.starts_with("phase=") => info!("{}", event.message),
            None => debug!("{}", event.message),
        }
    }
}
