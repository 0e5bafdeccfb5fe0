use crate::config::parse_bool;
use procrelay_core::KeyValueStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Store key of the persisted foreground preference
pub const FOREGROUND_KEY: &str = "carrier.foreground";

/// Resource that keeps the host from suspending the carrier
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Persistent indicator that the carrier is alive
pub trait ForegroundIndicator: Send + Sync {
    fn show(&self, text: &str);

    /// Replace the text of a visible indicator
    fn update(&self, text: &str) {
        self.show(text);
    }

    fn hide(&self);
}

/// Wake lock for hosts without one; records the transitions in the log
pub struct LoggingWakeLock {
    tag: String,
}

impl LoggingWakeLock {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl WakeLock for LoggingWakeLock {
    fn acquire(&self) {
        info!("Wake lock {} acquired", self.tag);
    }

    fn release(&self) {
        info!("Wake lock {} released", self.tag);
    }
}

pub struct LoggingIndicator;

impl ForegroundIndicator for LoggingIndicator {
    fn show(&self, text: &str) {
        info!("Foreground indicator: {}", text);
    }

    fn hide(&self) {
        info!("Foreground indicator hidden");
    }
}

/// Wake lock and foreground indicator state of a carrier.
///
/// Owned by the carrier's control loop, which serialises all toggles. Every
/// transition is idempotent.
pub struct Posture {
    wake_lock: Box<dyn WakeLock>,
    indicator: Box<dyn ForegroundIndicator>,
    store: Arc<dyn KeyValueStore>,
    foreground: bool,
    wake_lock_held: bool,
    indicator_visible: bool,
}

impl Posture {
    /// The stored preference wins over `foreground_by_default`.
    pub fn new(
        wake_lock: Box<dyn WakeLock>,
        indicator: Box<dyn ForegroundIndicator>,
        store: Arc<dyn KeyValueStore>,
        foreground_by_default: bool,
    ) -> Self {
        let foreground = match store.get(FOREGROUND_KEY) {
            Ok(Some(value)) => parse_bool(FOREGROUND_KEY, &value).unwrap_or_else(|e| {
                warn!("Ignoring stored foreground preference: {}", e);
                foreground_by_default
            }),
            Ok(None) => foreground_by_default,
            Err(e) => {
                warn!("Failed to read foreground preference: {}", e);
                foreground_by_default
            }
        };

        Self {
            wake_lock,
            indicator,
            store,
            foreground,
            wake_lock_held: false,
            indicator_visible: false,
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn is_wake_lock_held(&self) -> bool {
        self.wake_lock_held
    }

    pub fn is_indicator_visible(&self) -> bool {
        self.indicator_visible
    }

    pub fn indicator_text(&self) -> String {
        if self.wake_lock_held {
            "Executor service (wakelock held)".to_string()
        } else {
            "Executor service".to_string()
        }
    }

    /// Apply the preference the carrier starts with.
    pub fn start(&mut self) {
        if self.foreground {
            self.show_indicator();
        }
    }

    pub fn enter_foreground(&mut self) {
        self.set_foreground(true);
        self.show_indicator();
    }

    pub fn enter_background(&mut self) {
        self.set_foreground(false);
        self.hide_indicator();
    }

    pub fn toggle_wake_lock(&mut self) {
        if self.wake_lock_held {
            self.release_wake_lock();
        } else {
            self.acquire_wake_lock();
        }
    }

    pub fn acquire_wake_lock(&mut self) {
        if !self.wake_lock_held {
            self.wake_lock.acquire();
            self.wake_lock_held = true;
            self.refresh_indicator();
        }
    }

    pub fn release_wake_lock(&mut self) {
        if self.wake_lock_held {
            self.wake_lock.release();
            self.wake_lock_held = false;
            self.refresh_indicator();
        }
    }

    /// Release everything the carrier holds.
    pub fn shutdown(&mut self) {
        self.release_wake_lock();
        self.hide_indicator();
    }

    fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
        if let Err(e) = self.store.set(FOREGROUND_KEY, &foreground.to_string()) {
            warn!("Failed to store foreground preference: {}", e);
        }
    }

    fn show_indicator(&mut self) {
        if !self.indicator_visible {
            self.indicator.show(&self.indicator_text());
            self.indicator_visible = true;
        }
    }

    fn hide_indicator(&mut self) {
        if self.indicator_visible {
            self.indicator.hide();
            self.indicator_visible = false;
        }
    }

    fn refresh_indicator(&self) {
        if self.indicator_visible {
            self.indicator.update(&self.indicator_text());
        }
    }
}
