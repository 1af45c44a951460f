use crate::types::{DoorId, DoorState, NotificationEvent};

/// Raw digital inputs for the two door sensors.
pub trait DoorInputs {
    /// Line level for `door`; true when the input floats high.
    fn is_high(&mut self, door: DoorId) -> bool;
}

/// Last known state of each door. Both doors start out closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoorMonitor {
    door_1: DoorState,
    door_2: DoorState,
}

impl DoorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, door: DoorId) -> DoorState {
        match door {
            DoorId::One => self.door_1,
            DoorId::Two => self.door_2,
        }
    }

    /// Events announced at boot for both doors, before the first sample.
    pub fn startup_events(&self) -> [NotificationEvent; 2] {
        DoorId::ALL.map(|door| NotificationEvent::new(door, self.state(door)))
    }

    /// Records `state` for `door`, returning an event if it changed.
    pub fn observe(&mut self, door: DoorId, state: DoorState) -> Option<NotificationEvent> {
        let slot = match door {
            DoorId::One => &mut self.door_1,
            DoorId::Two => &mut self.door_2,
        };
        if *slot == state {
            return None;
        }
        *slot = state;
        Some(NotificationEvent::new(door, state))
    }

    /// Samples both inputs once and returns the transitions, door 1 first.
    pub fn poll<I: DoorInputs + ?Sized>(&mut self, inputs: &mut I) -> Vec<NotificationEvent> {
        DoorId::ALL
            .into_iter()
            .filter_map(|door| {
                let state = DoorState::from_level(inputs.is_high(door));
                self.observe(door, state)
            })
            .collect()
    }
}
