use std::time::Duration;

use crate::mesh::{CaptureConstraints, ParticipantId};

/// Membership is never polled faster than this, whatever the configuration says
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Config {
    room_id: String,
    local_id: ParticipantId,
    display_name: String,
    /// Initial admin flag. Refreshed from the room service once membership arrives
    is_admin: bool,
    /// Base url of the room service, eg `http://127.0.0.1:8000/`
    membership_url: String,
    poll_interval: Duration,
    capture: CaptureConstraints,
}

impl Config {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn membership_url(&self) -> &str {
        &self.membership_url
    }

    /// Interval between membership polls, clamped to [`MIN_POLL_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    pub fn capture(&self) -> CaptureConstraints {
        self.capture
    }
}

impl Config {
    pub fn room_id_mut(&mut self) -> &mut String {
        &mut self.room_id
    }

    pub fn local_id_mut(&mut self) -> &mut ParticipantId {
        &mut self.local_id
    }

    pub fn display_name_mut(&mut self) -> &mut String {
        &mut self.display_name
    }

    pub fn is_admin_mut(&mut self) -> &mut bool {
        &mut self.is_admin
    }

    pub fn membership_url_mut(&mut self) -> &mut String {
        &mut self.membership_url
    }

    pub fn poll_interval_mut(&mut self) -> &mut Duration {
        &mut self.poll_interval
    }

    pub fn capture_mut(&mut self) -> &mut CaptureConstraints {
        &mut self.capture
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            room_id: String::new(),
            local_id: ParticipantId::random(),
            display_name: "Guest".into(),
            is_admin: false,
            membership_url: "http://127.0.0.1:8000/".into(),
            poll_interval: Duration::from_secs(5),
            capture: CaptureConstraints::default(),
        }
    }
}

impl Config {
    /// Default configuration for local development
    pub fn development() -> Config {
        Config::default()
    }

    /// Test configuration. Keeps the default poll cadence so paused-clock
    /// tests can reason about ticks
    pub fn testing(room_id: &str, local_id: &str, display_name: &str) -> Config {
        Config {
            room_id: room_id.into(),
            local_id: local_id.into(),
            display_name: display_name.into(),
            membership_url: "http://localhost/".into(),
            ..Default::default()
        }
    }

    /// Recommended configuration for joining `room_id` on the room service at `membership_url`
    pub fn production(membership_url: &str, room_id: &str, display_name: &str) -> Config {
        Config {
            room_id: room_id.into(),
            display_name: display_name.into(),
            membership_url: membership_url.into(),
            ..Default::default()
        }
    }
}
