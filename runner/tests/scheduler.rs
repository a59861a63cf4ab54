use retrieval_runner::{
    config::{ConfigErrors, SchedulerConfig},
    ledger::{InputWarningLedger, RetrievalStatusLedger, RunResult},
    manual_queue::ManualQueue,
    scheduler::{RunSummary, Scheduler, SchedulerError},
    sync::{InstanceLock, LockError},
    work::Origin,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::{Duration, Instant},
};
use wait_timeout::ChildExt;

const METADATA: &str = r#"{
    "sensors": {
        "ma": {"serial_number": 61, "setups": [
            {"from_date": "20220101", "to_date": "20221231", "location_id": "TUM_I"}
        ]},
        "mc": {"serial_number": 115, "setups": [
            {"from_date": "20220101", "to_date": "20221231", "location_id": "TUM_I"}
        ]}
    },
    "locations": {
        "TUM_I": {"lat": 48.151, "lon": 11.569, "alt": 539.0}
    }
}"#;

/// Lay out a complete installation below `root` and return its config.
/// The fake algorithm is a shell script run through `/bin/sh`.
fn setup(root: &Path, parallelism: usize, algorithm: &str) -> SchedulerConfig {
    let code_dir = root.join("algorithm");
    fs::create_dir_all(&code_dir).unwrap();
    fs::write(root.join("algorithm.sh"), algorithm).unwrap();
    fs::write(
        root.join("template.yml"),
        "sensor: %SENSOR_ID%\ndate: %DATE%\nserial: %SERIAL_NUMBER%\n",
    )
    .unwrap();
    fs::write(root.join("metadata.json"), METADATA).unwrap();

    let yaml = format!(
        r#"
sensors: [ma, mc]
parallelism: {parallelism}
discovery:
  from_date: "20220101"
  to_date: "20221231"
data:
  interferograms: [{root}/ifg]
  datalogger:
    root: {root}/datalogger
    min_records: 3
  profiles:
    root: {root}/profiles
    model: GGG2014
  results: {root}/results
  metadata: {root}/metadata.json
algorithm:
  exec: /bin/sh
  params: [{root}/algorithm.sh]
  code_dir: {root}/algorithm
  config_template: {root}/template.yml
  code_version: v1.2.3
state:
  dir: {root}/state
  lock_timeout: 2
manual_queue: {root}/manual-queue.json
"#,
        root = root.display()
    );
    let config_path = root.join("config.yml");
    fs::write(&config_path, yaml).unwrap();

    SchedulerConfig::load(&config_path).unwrap()
}

fn write_inputs(root: &Path, sensor_id: &str, date: &str, datalogger: bool) {
    let ifg_dir = root.join("ifg").join(sensor_id).join(date);
    fs::create_dir_all(&ifg_dir).unwrap();
    fs::write(ifg_dir.join(format!("{sensor_id}{date}.ifg.001")), "ifg").unwrap();

    if datalogger {
        let datalogger_dir = root.join("datalogger").join(sensor_id);
        fs::create_dir_all(&datalogger_dir).unwrap();
        fs::write(
            datalogger_dir.join(format!("datalogger-{sensor_id}-{date}.csv")),
            "time,pressure\n00:00,950.1\n00:01,950.2\n00:02,950.3\n",
        )
        .unwrap();
    }

    let profiles_dir = root.join("profiles").join("GGG2014");
    fs::create_dir_all(&profiles_dir).unwrap();
    fs::write(profiles_dir.join(format!("{date}_48N012E.map")), "map").unwrap();
}

fn entries(dir: PathBuf) -> usize {
    fs::read_dir(dir).map_or(0, |entries| entries.count())
}

#[test]
fn processes_every_complete_day() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = setup(root, 2, "cp \"$3\" outputs/config.yml\n");
    write_inputs(root, "mc", "20220701", true);
    write_inputs(root, "mc", "20220702", true);
    write_inputs(root, "ma", "20220701", true);
    write_inputs(root, "ma", "20220703", false);

    let summary = Scheduler::new(config.clone()).unwrap().run().unwrap();
    assert_eq!(
        summary,
        RunSummary {
            succeeded: 3,
            failed: 0,
            not_launched: 0,
            cancelled: 0
        }
    );

    let rendered =
        fs::read_to_string(root.join("results/ma/successful/20220701/config.yml")).unwrap();
    assert_eq!(rendered, "sensor: ma\ndate: 20220701\nserial: 061\n");
    assert!(root.join("results/mc/successful/20220702/about.json").is_file());
    assert!(!root.join("results/ma/successful/20220703").exists());

    let warnings =
        InputWarningLedger::new(config.state.warnings_path(), Duration::from_secs(1)).load();
    assert_eq!(warnings.len(), 1);
    assert!(warnings["ma/20220703"].message.contains("datalogger files"));

    let statuses =
        RetrievalStatusLedger::new(config.state.status_path(), Duration::from_secs(1)).load();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|entry| entry.process_end_time.is_some()
        && entry.outcome == Some(RunResult::Success)));

    assert_eq!(entries(config.state.containers_dir()), 0);
    assert_eq!(entries(config.state.archive_dir()), 0);
}

#[test]
fn never_runs_more_than_parallelism_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let running = root.join("running");
    fs::create_dir_all(&running).unwrap();
    let script = format!(
        "touch {running}/$2\nls {running} | wc -l >> {peaks}\nsleep 0.3\nrm {running}/$2\n",
        running = running.display(),
        peaks = root.join("peaks").display()
    );
    let config = setup(root, 2, &script);
    for date in ["20220701", "20220702", "20220703", "20220704", "20220705"] {
        write_inputs(root, "mc", date, true);
    }

    let summary = Scheduler::new(config).unwrap().run().unwrap();
    assert_eq!(summary.succeeded, 5);

    let peaks = fs::read_to_string(root.join("peaks")).unwrap();
    let peaks: Vec<usize> = peaks.lines().map(|line| line.trim().parse().unwrap()).collect();
    assert_eq!(peaks.len(), 5);
    assert!(peaks.iter().all(|&peak| (1..=2).contains(&peak)));
}

#[test]
fn failed_runs_are_archived() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = setup(root, 1, "grep -q 'sensor: ma' \"$3\" && exit 2\nexit 0\n");
    write_inputs(root, "ma", "20220701", true);
    write_inputs(root, "mc", "20220701", true);

    let summary = Scheduler::new(config.clone()).unwrap().run().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    assert!(root.join("results/ma/failed/20220701/about.json").is_file());
    assert!(root.join("results/mc/successful/20220701").is_dir());
    assert_eq!(entries(config.state.archive_dir()), 1);
    assert_eq!(entries(config.state.containers_dir()), 0);

    let statuses =
        RetrievalStatusLedger::new(config.state.status_path(), Duration::from_secs(1)).load();
    let failed = statuses
        .iter()
        .find(|entry| entry.sensor_id == "ma")
        .unwrap();
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(failed.outcome, Some(RunResult::Failure));
}

#[test]
fn manual_items_go_first_and_are_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = setup(root, 1, "exit 0\n");
    write_inputs(root, "mc", "20220701", true);
    write_inputs(root, "mc", "20220702", true);
    write_inputs(root, "ma", "20220801", true);
    fs::write(
        &config.manual_queue,
        r#"{"items": [{"sensor_id": "mc", "date": "20220702", "priority": 3}]}"#,
    )
    .unwrap();

    let scheduler = Scheduler::new(config.clone()).unwrap();
    let preview = scheduler.preview_queue().unwrap();
    let order: Vec<String> = preview.iter().map(|item| item.to_string()).collect();
    assert_eq!(order, ["mc/20220702", "mc/20220701", "ma/20220801"]);
    assert_eq!(preview[0].origin, Origin::Manual);

    assert_eq!(scheduler.run().unwrap().succeeded, 3);

    let remaining = ManualQueue::new(&config.manual_queue, Duration::from_secs(1))
        .load(&config.sensors)
        .unwrap();
    assert!(remaining.is_empty());
}

#[test]
fn leftovers_of_a_previous_run_are_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = setup(root, 1, "exit 0\n");
    let scheduler = Scheduler::new(config.clone()).unwrap();

    fs::create_dir_all(
        config
            .state
            .containers_dir()
            .join("retrieval-container-0123456789ab"),
    )
    .unwrap();
    fs::write(
        config.state.status_path(),
        r#"[{"container_id": "0123456789ab", "sensor_id": "mc",
            "from_datetime": "2022-07-01T00:00:00Z", "location_id": "TUM_I",
            "ifg_count": 1, "process_start_time": "2022-07-02T10:00:00Z",
            "process_end_time": null}]"#,
    )
    .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary, RunSummary::default());

    assert_eq!(entries(config.state.containers_dir()), 0);
    assert_eq!(entries(config.state.archive_dir()), 1);
    assert!(RetrievalStatusLedger::new(config.state.status_path(), Duration::from_secs(1))
        .load()
        .is_empty());
}

#[test]
fn refuses_to_run_twice() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = setup(root, 1, "exit 0\n");
    let scheduler = Scheduler::new(config.clone()).unwrap();

    let _held = InstanceLock::acquire(&config.state.instance_lock_path()).unwrap();
    assert!(matches!(
        scheduler.run(),
        Err(SchedulerError::Lock(LockError::AlreadyRunning(_)))
    ));
}

#[test]
fn broken_installation_fails_preflight() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut config = setup(root, 1, "exit 0\n");
    config.algorithm.required_files = vec![PathBuf::from("bin/retrieval")];

    assert!(matches!(
        Scheduler::new(config),
        Err(SchedulerError::Config(ConfigErrors::PreflightFailed))
    ));
}

fn is_alive(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    // reaped by nobody yet, but no longer running
    fs::read_to_string(format!("/proc/{pid}/stat")).map_or(true, |stat| !stat.contains(") Z "))
}

#[test]
fn sigterm_stops_running_algorithms() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let pid_file = root.join("algorithm.pid");
    let config = setup(
        root,
        2,
        &format!("echo $$ >> {}\nexec sleep 30\n", pid_file.display()),
    );
    write_inputs(root, "mc", "20220701", true);
    write_inputs(root, "mc", "20220702", true);
    write_inputs(root, "mc", "20220703", true);

    let mut scheduler = Command::new(env!("CARGO_BIN_EXE_retrieval-runner"))
        .arg("--config")
        .arg(root.join("config.yml"))
        .arg("run")
        .spawn()
        .unwrap();

    let started = Instant::now();
    let pids = loop {
        let pids: Vec<i32> = fs::read_to_string(&pid_file)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        if pids.len() == 2 {
            break pids;
        }
        assert!(started.elapsed() < Duration::from_secs(10), "algorithms never started");
        thread::sleep(Duration::from_millis(50));
    };

    kill(Pid::from_raw(scheduler.id() as i32), Signal::SIGTERM).unwrap();
    let status = scheduler
        .wait_timeout(Duration::from_secs(15))
        .unwrap()
        .expect("scheduler kept running after SIGTERM");
    assert!(status.success());

    assert!(pids.iter().all(|&pid| !is_alive(pid)));
    assert_eq!(entries(config.state.containers_dir()), 0);
    assert_eq!(entries(config.state.archive_dir()), 2);
    assert!(!root.join("results/mc").exists());
    assert!(!InstanceLock::is_held(&config.state.instance_lock_path()));

    let statuses =
        RetrievalStatusLedger::new(config.state.status_path(), Duration::from_secs(1)).load();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|entry| entry.process_end_time.is_some()));
}
