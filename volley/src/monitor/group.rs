use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use super::{CollectorSpec, Monitor, MonitorContext, MonitorSummary};
use crate::error::Result;
use crate::stats::StatsGroup;

const UPDATE_BUFFER: usize = 64;

/// Snapshot of every monitor in a group, keyed by monitor name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorGroupUpdate {
    pub interval: IndexMap<String, StatsGroup>,
    pub cumulative: IndexMap<String, StatsGroup>,
}

/// Named monitors that all collect the same statistics, for instance one per
/// request type of a test.
#[derive(Debug)]
pub struct MonitorGroup {
    specs: Vec<CollectorSpec>,
    monitors: Mutex<IndexMap<String, Monitor>>,
    updates: broadcast::Sender<MonitorGroupUpdate>,
}

impl MonitorGroup {
    pub fn new<S>(specs: impl IntoIterator<Item = S>) -> Result<Self>
    where
        S: Into<CollectorSpec>,
    {
        let specs: Vec<CollectorSpec> = specs.into_iter().map(Into::into).collect();
        // Surface bad statistic names now rather than on first use.
        Monitor::new(specs.iter().cloned())?;
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Ok(Self {
            specs,
            monitors: Mutex::new(IndexMap::new()),
            updates,
        })
    }

    /// Create the named monitors up front, so they are reported even before their
    /// first call.
    pub fn init_monitors<N: Into<String>>(&self, names: impl IntoIterator<Item = N>) -> Result<()> {
        for name in names {
            self.monitor(name)?;
        }
        Ok(())
    }

    /// The monitor called `name`, created on first use.
    pub fn monitor(&self, name: impl Into<String>) -> Result<Monitor> {
        let name = name.into();
        let mut monitors = self.monitors.lock();
        if let Some(monitor) = monitors.get(&name) {
            return Ok(monitor.clone());
        }
        let monitor = Monitor::named(name.clone(), self.specs.iter().cloned())?;
        monitors.insert(name, monitor.clone());
        Ok(monitor)
    }

    pub fn start(&self, name: impl Into<String>) -> Result<MonitorContext> {
        Ok(self.monitor(name)?.start())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorGroupUpdate> {
        self.updates.subscribe()
    }

    pub fn interval(&self) -> IndexMap<String, StatsGroup> {
        self.monitors
            .lock()
            .iter()
            .map(|(name, m)| (name.clone(), m.interval()))
            .collect()
    }

    pub fn cumulative(&self) -> IndexMap<String, StatsGroup> {
        self.monitors
            .lock()
            .iter()
            .map(|(name, m)| (name.clone(), m.cumulative()))
            .collect()
    }

    pub fn summary(&self) -> IndexMap<String, MonitorSummary> {
        self.monitors
            .lock()
            .iter()
            .map(|(name, m)| (name.clone(), m.summary()))
            .collect()
    }

    /// Publish a snapshot of every monitor, then update each of them.
    pub fn update(&self) -> MonitorGroupUpdate {
        let monitors: Vec<Monitor> = self.monitors.lock().values().cloned().collect();
        let mut update = MonitorGroupUpdate::default();
        for monitor in monitors {
            let snapshot = monitor.update();
            update.interval.insert(snapshot.name.clone(), snapshot.interval);
            update.cumulative.insert(snapshot.name, snapshot.cumulative);
        }
        let _ = self.updates.send(update.clone());
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Outcome;
    use crate::stats::Statistic;

    #[test]
    fn monitors_are_created_lazily_and_share_statistics() {
        let group = MonitorGroup::new(["result-codes", "latency"]).unwrap();
        group.init_monitors(["read"]).unwrap();
        assert_eq!(group.cumulative().len(), 1);

        group.start("write").unwrap().end(&Outcome::ok());
        group.start("write").unwrap().end(&Outcome::with_code(500));

        let cumulative = group.cumulative();
        assert_eq!(cumulative.len(), 2);
        assert_eq!(cumulative["read"]["result-codes"].len(), 0);
        assert_eq!(cumulative["write"]["result-codes"].len(), 2);
        assert!(cumulative["write"].contains_key("latency"));
    }

    #[test]
    fn update_reports_each_monitor_and_clears_intervals() {
        let group = MonitorGroup::new(["result-codes"]).unwrap();
        group.start("a").unwrap().end(&Outcome::ok());

        let update = group.update();
        assert_eq!(update.interval["a"]["result-codes"].len(), 1);
        assert_eq!(group.interval()["a"]["result-codes"].len(), 0);
        assert_eq!(group.cumulative()["a"]["result-codes"].len(), 1);
    }

    #[test]
    fn rejects_unknown_statistics_up_front() {
        assert!(MonitorGroup::new(["latency", "bogus"]).is_err());
    }
}
