//! Network state monitor
//!
//! Single source of truth for connectivity and link quality. The host feeds
//! platform signals in (`set_online`, `set_link_type`, an optional battery
//! probe); everything else in the engine only reads.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::observer::{Subject, Subscription};

/// Link quality as seen by the sync scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Good,
    Poor,
    Offline,
}

/// Platform-reported link type, when the platform exposes one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    Wired,
}

impl LinkType {
    fn is_low_bandwidth(self) -> bool {
        matches!(self, LinkType::Slow2g | LinkType::TwoG)
    }
}

/// Coarse speed estimate used to scale request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSpeed {
    Slow,
    Normal,
    Fast,
}

/// Snapshot of the monitor's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_online: bool,
    pub quality: NetworkQuality,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    /// Charge level in `0.0..=1.0`
    pub level: f32,
    pub charging: bool,
}

impl BatteryStatus {
    const LOW_LEVEL: f32 = 0.15;

    pub fn is_low(&self) -> bool {
        self.level < Self::LOW_LEVEL && !self.charging
    }
}

/// Optional battery introspection. Platforms without it simply don't
/// install a probe.
pub trait BatteryProbe: Send + Sync {
    fn status(&self) -> Option<BatteryStatus>;
}

struct LinkState {
    online: bool,
    link: Option<LinkType>,
}

pub struct NetworkMonitor {
    state: RwLock<LinkState>,
    listeners: Subject<bool>,
    battery: Option<Arc<dyn BatteryProbe>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            state: RwLock::new(LinkState {
                online: initially_online,
                link: None,
            }),
            listeners: Subject::new(),
            battery: None,
        }
    }

    pub fn with_battery_probe(mut self, probe: Arc<dyn BatteryProbe>) -> Self {
        self.battery = Some(probe);
        self
    }

    pub fn get_online_status(&self) -> bool {
        self.state.read().online
    }

    /// Offline when disconnected, poor on low-bandwidth links, good otherwise.
    /// A platform that reports no link type is treated as good.
    pub fn get_network_quality(&self) -> NetworkQuality {
        let state = self.state.read();
        if !state.online {
            NetworkQuality::Offline
        } else if state.link.is_some_and(LinkType::is_low_bandwidth) {
            NetworkQuality::Poor
        } else {
            NetworkQuality::Good
        }
    }

    pub fn state(&self) -> NetworkState {
        NetworkState {
            is_online: self.get_online_status(),
            quality: self.get_network_quality(),
        }
    }

    pub fn network_speed(&self) -> NetworkSpeed {
        match self.state.read().link {
            Some(LinkType::Slow2g) | Some(LinkType::TwoG) => NetworkSpeed::Slow,
            Some(LinkType::FourG) | Some(LinkType::Wired) => NetworkSpeed::Fast,
            Some(LinkType::ThreeG) | None => NetworkSpeed::Normal,
        }
    }

    /// Register a callback for online/offline transitions
    pub fn add_online_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |online: &bool| listener(*online))
    }

    /// Composite gate used before draining the sync queue
    pub fn should_sync_now(&self) -> bool {
        if self.get_network_quality() != NetworkQuality::Good {
            return false;
        }
        match self.battery.as_ref().and_then(|probe| probe.status()) {
            Some(status) if status.is_low() => {
                tracing::debug!(level = status.level, "Battery low and not charging, deferring sync");
                false
            }
            _ => true,
        }
    }

    /// Report connectivity from the platform. Listeners run only when the
    /// value actually changes.
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.state.write();
            if state.online == online {
                return;
            }
            state.online = online;
        }

        if online {
            tracing::info!("Network: online");
        } else {
            tracing::warn!("Network: offline");
        }
        self.listeners.publish(&online);
    }

    /// Report the platform link type; `None` when the signal is unavailable
    pub fn set_link_type(&self, link: Option<LinkType>) {
        self.state.write().link = link;
        tracing::debug!(link = ?link, quality = ?self.get_network_quality(), "Link type updated");
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every registered listener
    pub fn dispose(&self) {
        self.listeners.clear();
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBattery(Option<BatteryStatus>);

    impl BatteryProbe for FixedBattery {
        fn status(&self) -> Option<BatteryStatus> {
            self.0
        }
    }

    #[test]
    fn test_quality_follows_connectivity_and_link() {
        let monitor = NetworkMonitor::new(true);
        assert_eq!(monitor.get_network_quality(), NetworkQuality::Good);

        monitor.set_link_type(Some(LinkType::TwoG));
        assert_eq!(monitor.get_network_quality(), NetworkQuality::Poor);
        assert_eq!(monitor.network_speed(), NetworkSpeed::Slow);

        monitor.set_link_type(Some(LinkType::FourG));
        assert_eq!(monitor.get_network_quality(), NetworkQuality::Good);
        assert_eq!(monitor.network_speed(), NetworkSpeed::Fast);

        monitor.set_online(false);
        assert_eq!(monitor.get_network_quality(), NetworkQuality::Offline);
        assert!(!monitor.state().is_online);
    }

    #[test]
    fn test_missing_link_signal_is_good() {
        let monitor = NetworkMonitor::new(true);
        monitor.set_link_type(None);
        assert_eq!(monitor.get_network_quality(), NetworkQuality::Good);
        assert_eq!(monitor.network_speed(), NetworkSpeed::Normal);
    }

    #[test]
    fn test_listeners_fire_once_per_transition() {
        let monitor = NetworkMonitor::new(false);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        let _a = monitor.add_online_listener(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        let _b = monitor.add_online_listener(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_online(true);
        monitor.set_online(true); // not a transition
        monitor.set_online(false);

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_listener() {
        let monitor = NetworkMonitor::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = monitor.add_online_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        monitor.set_online(true);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.listener_count(), 0);
    }

    #[test]
    fn test_should_sync_now_gates() {
        let monitor = NetworkMonitor::new(false);
        assert!(!monitor.should_sync_now());

        monitor.set_online(true);
        assert!(monitor.should_sync_now());

        monitor.set_link_type(Some(LinkType::Slow2g));
        assert!(!monitor.should_sync_now());
    }

    #[test]
    fn test_low_battery_defers_sync() {
        let low = NetworkMonitor::new(true).with_battery_probe(Arc::new(FixedBattery(Some(
            BatteryStatus { level: 0.05, charging: false },
        ))));
        assert!(!low.should_sync_now());

        let charging = NetworkMonitor::new(true).with_battery_probe(Arc::new(FixedBattery(Some(
            BatteryStatus { level: 0.05, charging: true },
        ))));
        assert!(charging.should_sync_now());

        let unknown = NetworkMonitor::new(true).with_battery_probe(Arc::new(FixedBattery(None)));
        assert!(unknown.should_sync_now());
    }
}
