use crate::{
    checker::{Availability, InputChecker},
    collector::PendingDates,
    ledger::InputWarningLedger,
    manual_queue::ManualQueue,
    work::{SensorDate, WorkItem},
};
use chrono::NaiveDate;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashSet, VecDeque},
};
use tracing::{debug, error, info, warn};

/// pending discovered dates per sensor, each ascending
pub type Backlog = BTreeMap<String, VecDeque<NaiveDate>>;

/// Policy choosing which sensor's discovered work is served next
pub trait SensorSelection {
    fn select<'a>(&self, backlog: &'a Backlog, previous: Option<&str>) -> Option<&'a str>;
}

/// Serve the sensor with the most pending dates.
/// Ties keep the previously served sensor, then go to the smallest sensor id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestBacklog;

impl SensorSelection for LargestBacklog {
    fn select<'a>(&self, backlog: &'a Backlog, previous: Option<&str>) -> Option<&'a str> {
        backlog
            .iter()
            .filter(|(_, dates)| !dates.is_empty())
            .max_by_key(|(sensor_id, dates)| {
                (
                    dates.len(),
                    previous == Some(sensor_id.as_str()),
                    Reverse(*sensor_id),
                )
            })
            .map(|(sensor_id, _)| sensor_id.as_str())
    }
}

/// Merges manual overrides and discovered work into one pull based ordering.
/// Every (sensor, date) is yielded or discarded at most once per queue instance.
pub struct RetrievalQueue {
    sensors: Vec<String>,
    manual: Option<ManualQueue>,
    defer_negative_priority: bool,
    pending: Box<dyn PendingDates>,
    checker: Box<dyn InputChecker>,
    selection: Box<dyn SensorSelection>,
    warnings: InputWarningLedger,
    backlog: Option<Backlog>,
    seen: HashSet<SensorDate>,
    previous: Option<String>,
    iteration: usize,
}

impl RetrievalQueue {
    pub fn new(
        sensors: Vec<String>,
        pending: Box<dyn PendingDates>,
        checker: Box<dyn InputChecker>,
        warnings: InputWarningLedger,
    ) -> Self {
        Self {
            sensors,
            manual: None,
            defer_negative_priority: false,
            pending,
            checker,
            selection: Box::new(LargestBacklog),
            warnings,
            backlog: None,
            seen: HashSet::new(),
            previous: None,
            iteration: 0,
        }
    }

    pub fn with_manual_queue(mut self, manual: ManualQueue, defer_negative_priority: bool) -> Self {
        self.manual = Some(manual);
        self.defer_negative_priority = defer_negative_priority;
        self
    }

    pub fn with_selection(mut self, selection: Box<dyn SensorSelection>) -> Self {
        self.selection = selection;
        self
    }

    /// Next item whose inputs are complete, `None` once everything is drained
    pub fn get_next_item(&mut self) -> Option<WorkItem> {
        self.iteration += 1;
        let manual_items = self.manual_items();
        let (deferred, urgent): (Vec<_>, Vec<_>) = manual_items
            .into_iter()
            .partition(|item| self.defer_negative_priority && item.priority < 0);

        if let Some(item) = self.first_available(urgent) {
            info!(iteration = self.iteration, item = %item, "Serving item from manual queue");
            return Some(item);
        }

        if let Some(item) = self.next_discovered() {
            info!(iteration = self.iteration, item = %item, "Serving discovered item");
            return Some(item);
        }

        if let Some(item) = self.first_available(deferred) {
            info!(
                iteration = self.iteration,
                item = %item,
                "Serving item from manual queue (low priority)"
            );
            return Some(item);
        }

        debug!(iteration = self.iteration, "Retrieval queue is drained");
        None
    }

    /// the override file is re-read on every call so edits take effect during a run
    fn manual_items(&self) -> Vec<WorkItem> {
        let Some(manual) = self.manual.as_ref() else {
            return Vec::new();
        };

        match manual.load(&self.sensors) {
            Ok(items) => items,
            Err(e) => {
                error!(path = ?manual.path(), "Ignoring manual queue for this iteration: {e}");
                Vec::new()
            }
        }
    }

    /// Mark `item` as seen and run the availability check.
    /// Deficient items are recorded in the warning ledger and dropped.
    fn admit(&mut self, item: &WorkItem) -> bool {
        let sensor_date = item.sensor_date();

        if !self.seen.insert(sensor_date.clone()) {
            return false;
        }

        match self.checker.check(&item.sensor_id, item.date) {
            Availability::Ok => true,
            Availability::Deficient(deficiency) => {
                warn!(
                    sensor = %item.sensor_id,
                    date = %item.date_string(),
                    category = deficiency.category(),
                    "Skipping: {deficiency}"
                );
                self.warnings.add(&sensor_date, &deficiency.to_string());
                false
            }
        }
    }

    fn first_available(&mut self, items: Vec<WorkItem>) -> Option<WorkItem> {
        items.into_iter().find(|item| self.admit(item))
    }

    fn backlog(&mut self) -> &mut Backlog {
        let sensors = &self.sensors;
        let pending = &self.pending;

        self.backlog.get_or_insert_with(|| {
            sensors
                .iter()
                .map(|sensor_id| {
                    let dates = pending.list_pending_dates(sensor_id);
                    info!(sensor = %sensor_id, count = dates.len(), "Discovered pending dates");

                    (sensor_id.clone(), VecDeque::from(dates))
                })
                .collect()
        })
    }

    fn next_discovered(&mut self) -> Option<WorkItem> {
        self.backlog();

        loop {
            let backlog = self.backlog.as_mut()?;
            let sensor_id = self
                .selection
                .select(backlog, self.previous.as_deref())?
                .to_string();
            let date = backlog.get_mut(&sensor_id)?.pop_front()?;
            let item = WorkItem::discovered(sensor_id, date);

            if self.admit(&item) {
                self.previous = Some(item.sensor_id.clone());
                return Some(item);
            }
        }
    }

    /// remaining discovered dates per sensor, empty sensors omitted
    pub fn pending_counts(&mut self) -> BTreeMap<String, usize> {
        self.backlog()
            .iter()
            .filter(|(_, dates)| !dates.is_empty())
            .map(|(sensor_id, dates)| (sensor_id.clone(), dates.len()))
            .collect()
    }
}

impl Iterator for RetrievalQueue {
    type Item = WorkItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next_item()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checker::Deficiency,
        work::{parse_date, Origin},
    };
    use std::{collections::HashMap, fs, path::Path, time::Duration};

    struct FakePending(HashMap<String, Vec<&'static str>>);

    impl PendingDates for FakePending {
        fn list_pending_dates(&self, sensor_id: &str) -> Vec<NaiveDate> {
            self.0
                .get(sensor_id)
                .map(|dates| dates.iter().filter_map(|date| parse_date(date)).collect())
                .unwrap_or_default()
        }
    }

    /// deficient for the listed `sensor/date` keys, everything else passes
    struct FakeChecker(Vec<&'static str>);

    impl InputChecker for FakeChecker {
        fn check(&self, sensor_id: &str, date: NaiveDate) -> Availability {
            let key = SensorDate::new(sensor_id, date).key();

            if self.0.contains(&key.as_str()) {
                Availability::Deficient(Deficiency::IfgFiles(String::from("empty directory")))
            } else {
                Availability::Ok
            }
        }
    }

    fn queue(
        dir: &Path,
        pending: &[(&str, Vec<&'static str>)],
        deficient: Vec<&'static str>,
    ) -> RetrievalQueue {
        RetrievalQueue::new(
            vec!["ma".into(), "mc".into()],
            Box::new(FakePending(
                pending
                    .iter()
                    .map(|(sensor_id, dates)| (sensor_id.to_string(), dates.clone()))
                    .collect(),
            )),
            Box::new(FakeChecker(deficient)),
            InputWarningLedger::new(dir.join("warnings.json"), Duration::from_secs(1)),
        )
    }

    fn drain(queue: &mut RetrievalQueue) -> Vec<String> {
        queue.map(|item| item.to_string()).collect()
    }

    #[test]
    fn larger_backlog_is_served_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220601", "20220602"]), ("ma", vec!["20220601"])],
            Vec::new(),
        );

        assert_eq!(queue.get_next_item().unwrap().to_string(), "mc/20220601");
        assert_eq!(queue.get_next_item().unwrap().to_string(), "mc/20220602");
        assert_eq!(queue.get_next_item().unwrap().to_string(), "ma/20220601");
        assert_eq!(queue.get_next_item(), None);
    }

    #[test]
    fn equal_backlogs_go_to_the_smallest_sensor_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220601"]), ("ma", vec!["20220603"])],
            Vec::new(),
        );

        assert_eq!(drain(&mut queue), vec!["ma/20220603", "mc/20220601"]);
    }

    #[test]
    fn manual_items_come_first_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        fs::write(
            &path,
            r#"{"items": [
                {"sensor_id": "mc", "date": "20220701", "priority": 1},
                {"sensor_id": "ma", "date": "20220702", "priority": -3}
            ]}"#,
        )
        .unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220601", "20220602", "20220603"])],
            Vec::new(),
        )
        .with_manual_queue(ManualQueue::new(&path, Duration::from_secs(1)), false);

        let first = queue.get_next_item().unwrap();
        assert_eq!(first.to_string(), "mc/20220701");
        assert_eq!(first.origin, Origin::Manual);
        assert_eq!(
            drain(&mut queue),
            vec!["ma/20220702", "mc/20220601", "mc/20220602", "mc/20220603"]
        );
    }

    #[test]
    fn negative_manual_priorities_can_be_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        fs::write(
            &path,
            r#"{"items": [
                {"sensor_id": "ma", "date": "20220702", "priority": -3},
                {"sensor_id": "mc", "date": "20220701", "priority": 2}
            ]}"#,
        )
        .unwrap();
        let mut queue = queue(dir.path(), &[("mc", vec!["20220601"])], Vec::new())
            .with_manual_queue(ManualQueue::new(&path, Duration::from_secs(1)), true);

        assert_eq!(
            drain(&mut queue),
            vec!["mc/20220701", "mc/20220601", "ma/20220702"]
        );
    }

    #[test]
    fn deficient_items_are_skipped_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220701", "20220702"])],
            vec!["mc/20220701"],
        );

        assert_eq!(drain(&mut queue), vec!["mc/20220702"]);

        let warnings =
            InputWarningLedger::new(dir.path().join("warnings.json"), Duration::from_secs(1))
                .load();
        assert_eq!(warnings.len(), 1);
        assert!(warnings["mc/20220701"].message.contains("ifg files"));
    }

    #[test]
    fn manual_and_discovered_duplicates_are_served_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        fs::write(
            &path,
            r#"{"items": [{"sensor_id": "mc", "date": "20220602", "priority": 1}]}"#,
        )
        .unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220601", "20220602"])],
            Vec::new(),
        )
        .with_manual_queue(ManualQueue::new(&path, Duration::from_secs(1)), false);

        assert_eq!(drain(&mut queue), vec!["mc/20220602", "mc/20220601"]);
    }

    #[test]
    fn malformed_manual_queue_does_not_block_discovered_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual-queue.json");
        fs::write(&path, r#"{"items": [{"sensor_id": "mc", "date": "bad", "priority": 1}]}"#)
            .unwrap();
        let mut queue = queue(dir.path(), &[("ma", vec!["20220601"])], Vec::new())
            .with_manual_queue(ManualQueue::new(&path, Duration::from_secs(1)), false);

        assert_eq!(drain(&mut queue), vec!["ma/20220601"]);
    }

    #[test]
    fn selection_policy_is_pluggable() {
        struct SmallestBacklog;

        impl SensorSelection for SmallestBacklog {
            fn select<'a>(&self, backlog: &'a Backlog, _previous: Option<&str>) -> Option<&'a str> {
                backlog
                    .iter()
                    .filter(|(_, dates)| !dates.is_empty())
                    .min_by_key(|(_, dates)| dates.len())
                    .map(|(sensor_id, _)| sensor_id.as_str())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue(
            dir.path(),
            &[("mc", vec!["20220601", "20220602"]), ("ma", vec!["20220601"])],
            Vec::new(),
        )
        .with_selection(Box::new(SmallestBacklog));

        assert_eq!(queue.pending_counts().get("mc"), Some(&2));
        assert_eq!(queue.get_next_item().unwrap().to_string(), "ma/20220601");
    }
}
