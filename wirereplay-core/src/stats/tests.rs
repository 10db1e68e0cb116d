//! Tests for the stats sink

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::*;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn stat(order: i64, latency_us: Option<u64>, errors: Vec<String>) -> OpStat {
    OpStat {
        seen_connection_num: 3,
        played_connection_num: 1,
        generation: 0,
        order,
        op_type: "msg".to_string(),
        namespace: "app.users".to_string(),
        command: Some("find".to_string()),
        played_at: Utc::now(),
        latency_us,
        play_lag_us: 0,
        num_returned: 2,
        errors,
    }
}

#[test]
fn test_json_lines_and_summary() {
    let buf = SharedBuf::default();
    let collector = StatCollector::new(StatFormat::Json, Box::new(buf.clone()));
    collector.record(&stat(0, Some(100), vec![]));
    collector.record(&stat(1, Some(300), vec!["ns not found".to_string()]));
    collector.record(&stat(2, None, vec![]));

    let report = collector.close().unwrap();
    assert_eq!(report.ops_recorded, 3);
    assert_eq!(report.ops_with_errors, 1);
    assert_eq!(report.mean_latency_us, 200);
    assert_eq!(report.max_latency_us, 300);
    assert_eq!(report.run_id, collector.run_id());

    let text = buf.text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    let first: OpStat = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.command.as_deref(), Some("find"));
    let summary: serde_json::Value = serde_json::from_str(lines[3]).unwrap();
    assert_eq!(summary["summary"]["ops_recorded"], 3);
}

#[test]
fn test_text_format() {
    let buf = SharedBuf::default();
    let collector = StatCollector::new(StatFormat::Text, Box::new(buf.clone()));
    collector.record(&stat(5, Some(42), vec!["boom".to_string()]));
    collector.close().unwrap();

    let text = buf.text();
    assert!(text.contains("conn 3->1 gen 0 #5 msg find app.users latency=42us"));
    assert!(text.contains("errors=[boom]"));
    assert!(text.contains("Ops with errors: 1"));
}

#[test]
fn test_none_format_only_counts() {
    let buf = SharedBuf::default();
    let collector = StatCollector::new(StatFormat::None, Box::new(buf.clone()));
    collector.record(&stat(0, Some(10), vec![]));
    let report = collector.close().unwrap();
    assert_eq!(report.ops_recorded, 1);
    assert!(buf.text().is_empty());

    // records after close are ignored
    collector.record(&stat(1, Some(10), vec![]));
    assert_eq!(collector.snapshot().ops_recorded, 1);
}

#[test]
fn test_concurrent_records_stay_whole_lines() {
    let buf = SharedBuf::default();
    let collector = Arc::new(StatCollector::new(StatFormat::Json, Box::new(buf.clone())));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let collector = Arc::clone(&collector);
            std::thread::spawn(move || {
                for i in 0..50 {
                    collector.record(&stat(t * 100 + i, Some(1), vec![]));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    collector.close().unwrap();

    let text = buf.text();
    let records = text
        .lines()
        .filter(|l| !l.starts_with("{\"summary\""))
        .map(|l| serde_json::from_str::<OpStat>(l).unwrap())
        .count();
    assert_eq!(records, 400);
}

#[test]
fn test_format_parsing() {
    assert_eq!("JSON".parse::<StatFormat>().unwrap(), StatFormat::Json);
    assert_eq!("text".parse::<StatFormat>().unwrap(), StatFormat::Text);
    assert!("xml".parse::<StatFormat>().is_err());
    assert_eq!(StatFormat::default().to_string(), "none");
}
