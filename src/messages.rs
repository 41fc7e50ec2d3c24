use crate::tracker::{TrackerState, TrapSnapshot};

/// Commands received over MQTT, addressed by sanitized device name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrapCommand {
    Reset(/* device */ String),
    Refresh(/* device */ String),
    Rename { device: String, name: String },
}

impl TrapCommand {
    pub fn device(&self) -> &str {
        match self {
            TrapCommand::Reset(device) | TrapCommand::Refresh(device) => device,
            TrapCommand::Rename { device, .. } => device,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrapAnnouncement {
    pub name: String,
    pub mac_address: String,
    pub state: TrackerState,
    pub snapshot: TrapSnapshot,
}
