use event_log::{EventRecord, JsonlEventLog, RelayEvent};
use relay_core::{Mode, TerminationCause, Tier};

fn sweep_events() -> Vec<RelayEvent> {
    vec![
        RelayEvent::ModeTransition {
            from: Mode::Throttle,
            to: Mode::Emergency,
            cost_ratio: 0.96,
            terminated: 1,
        },
        RelayEvent::SessionTerminated {
            session_id: "sess-1".into(),
            peer_id: "peer-free".into(),
            tier: Tier::Free,
            cause: TerminationCause::Sweep,
        },
    ]
}

#[test]
fn records_are_one_json_object_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    for ev in sweep_events() {
        log.append(5_000, &ev).unwrap();
    }
    let raw = std::fs::read_to_string(log.path()).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        r#"{"id":1,"ts_ms":5000,"payload":{"event":"mode_transition","from":"throttle","to":"emergency","cost_ratio":0.96,"terminated":1}}"#
    );
    assert!(lines[1].contains(r#""cause":"sweep""#));
}

#[test]
fn read_all_returns_typed_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    let events = sweep_events();
    for ev in &events {
        log.append(1, ev).unwrap();
    }
    let got: Vec<RelayEvent> = log.read_all().unwrap().into_iter().map(|r| r.payload).collect();
    assert_eq!(got, events);
}

#[test]
fn read_range_is_half_open() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    for i in 0..5u64 {
        log.append(i, &i).unwrap();
    }
    let got: Vec<EventRecord<u64>> = log.read_range(2, 4).unwrap();
    let ids: Vec<u64> = got.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn corrupt_line_surfaces_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    std::fs::write(&path, "{\"id\":1,\"ts_ms\":0,\"payload\":1}\nnot json\n").unwrap();
    assert!(JsonlEventLog::open(&path).is_err());
}

#[test]
fn interrupted_append_is_dropped_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    {
        let log = JsonlEventLog::open(&path).unwrap();
        log.append(1, &"kept").unwrap();
    }
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    std::io::Write::write_all(&mut f, br#"{"id":2,"ts_ms":2,"payl"#).unwrap();
    drop(f);

    let log = JsonlEventLog::open(&path).unwrap();
    assert_eq!(log.append(3, &"next").unwrap(), 2);
    let got: Vec<EventRecord<String>> = log.read_range(0, u64::MAX).unwrap();
    let payloads: Vec<&str> = got.iter().map(|r| r.payload.as_str()).collect();
    assert_eq!(payloads, vec!["kept", "next"]);
}

#[test]
fn complete_record_missing_newline_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    std::fs::write(&path, r#"{"id":7,"ts_ms":0,"payload":"a"}"#).unwrap();
    let log = JsonlEventLog::open(&path).unwrap();
    assert_eq!(log.append(1, &"b").unwrap(), 8);
    let got: Vec<EventRecord<String>> = log.read_range(0, u64::MAX).unwrap();
    assert_eq!(got.iter().map(|r| r.id).collect::<Vec<_>>(), vec![7, 8]);
}

#[test]
fn concurrent_appends_get_unique_ids() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = log.clone();
            std::thread::spawn(move || {
                for i in 0..25u64 {
                    log.append(t * 100 + i, &"x").unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let mut ids: Vec<u64> = log.read_range::<String>(0, u64::MAX).unwrap().iter().map(|r| r.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=200).collect::<Vec<_>>());
}
