use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::NodeSettings;
use crate::message::NodeId;

/// What the event loop does on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Application,
    CriticalSection,
}

/// Random source for event timing and choice.
pub struct EventGenerator {
    rng: StdRng,
    settings: NodeSettings,
}

impl EventGenerator {
    /// With a configured seed every node gets its own reproducible stream.
    pub fn new(id: NodeId, settings: &NodeSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            settings: settings.clone(),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.settings.event_delay()))
    }

    pub fn next_event(&mut self) -> Event {
        let decider: u32 = self.rng.gen_range(1..=100);
        if decider <= self.settings.application_percent {
            Event::Application
        } else {
            Event::CriticalSection
        }
    }

    pub fn critical_section_time(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.settings.critical_section()))
    }
}
