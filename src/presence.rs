use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{STATUS_PROCESSING, STATUS_UP_NEEDED};
use crate::hal::PresenceButton;

/// Button sampling interval. Cancellation is observed on the same boundary.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocks a command until the user proves presence or the client cancels.
pub struct PresenceGate {
    button: Arc<dyn PresenceButton>,
}

impl PresenceGate {
    pub fn new(button: Arc<dyn PresenceButton>) -> Self {
        Self { button }
    }

    /// Wait for a button press. Returns `true` on press, `false` once
    /// `cancelled` is raised. While waiting, `keepalive_status` is parked at
    /// the touch-needed value so the keep-alive scheduler reports status 2;
    /// it reverts to plain processing on the way out.
    pub fn wait(&self, cancelled: &AtomicBool, keepalive_status: &AtomicU8) -> bool {
        log::info!("waiting for user presence");
        keepalive_status.store(STATUS_UP_NEEDED, Ordering::SeqCst);
        let granted = loop {
            if cancelled.load(Ordering::SeqCst) {
                log::info!("user-presence wait cancelled");
                break false;
            }
            if self.button.is_pressed() {
                log::info!("user presence confirmed");
                break true;
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        keepalive_status.store(STATUS_PROCESSING, Ordering::SeqCst);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockButton;

    #[test]
    fn held_button_grants_immediately() {
        let gate = PresenceGate::new(Arc::new(MockButton::held()));
        let cancelled = AtomicBool::new(false);
        let status = AtomicU8::new(STATUS_PROCESSING);
        assert!(gate.wait(&cancelled, &status));
        assert_eq!(status.load(Ordering::SeqCst), STATUS_PROCESSING);
    }

    #[test]
    fn cancel_flag_denies() {
        let (button, _pressed) = MockButton::released();
        let gate = PresenceGate::new(Arc::new(button));
        let cancelled = AtomicBool::new(true);
        let status = AtomicU8::new(STATUS_PROCESSING);
        assert!(!gate.wait(&cancelled, &status));
    }

    #[test]
    fn late_press_is_picked_up_by_polling() {
        let (button, pressed) = MockButton::released();
        let gate = PresenceGate::new(Arc::new(button));
        let cancelled = Arc::new(AtomicBool::new(false));
        let status = AtomicU8::new(STATUS_PROCESSING);

        let presser = {
            let pressed = pressed.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                pressed.store(true, Ordering::SeqCst);
            })
        };
        assert!(gate.wait(&cancelled, &status));
        presser.join().unwrap();
    }
}
