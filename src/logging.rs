use log::LevelFilter;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Install the global logger.
///
/// Records go to stdout and, when `log_file` is set, are appended to that file as well.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<(), fern::InitError> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // Transport crates are noisy at debug
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// Rate-limited logging helper.
///
/// `should_log` returns true at most once per interval for a given key, so a
/// condition that repeats on every reconciliation pass is reported once per
/// interval instead of flooding the log.
#[derive(Debug)]
pub struct ThrottledLogger {
    interval: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl ThrottledLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    pub fn should_log_at(&self, key: &str, now: Instant) -> bool {
        let mut last_emitted = match self.last_emitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match last_emitted.get(key) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            _ => {
                last_emitted.insert(key.to_string(), now);
                true
            }
        }
    }
}
