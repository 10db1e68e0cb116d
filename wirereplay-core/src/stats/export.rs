//! Stat line formatting

use super::{OpStat, StatsReport};

/// Formats stat records and reports
pub struct StatExporter;

impl StatExporter {
    /// One record as a JSON object
    pub fn to_json_line(stat: &OpStat) -> Result<String, serde_json::Error> {
        serde_json::to_string(stat)
    }

    /// One record as a readable line
    pub fn to_text_line(stat: &OpStat) -> String {
        let mut line = format!(
            "{} conn {}->{} gen {} #{} {}",
            stat.played_at.format("%H:%M:%S%.6f"),
            stat.seen_connection_num,
            stat.played_connection_num,
            stat.generation,
            stat.order,
            stat.op_type,
        );
        if let Some(command) = &stat.command {
            line.push_str(&format!(" {}", command));
        }
        if !stat.namespace.is_empty() {
            line.push_str(&format!(" {}", stat.namespace));
        }
        if let Some(latency) = stat.latency_us {
            line.push_str(&format!(" latency={}us", latency));
        }
        if stat.num_returned > 0 {
            line.push_str(&format!(" returned={}", stat.num_returned));
        }
        if stat.play_lag_us > 0 {
            line.push_str(&format!(" lag={}us", stat.play_lag_us));
        }
        if !stat.errors.is_empty() {
            line.push_str(&format!(" errors=[{}]", stat.errors.join("; ")));
        }
        line
    }

    /// Report as a JSON object tagged as the summary line
    pub fn to_json_summary(report: &StatsReport) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({ "summary": report }))
    }

    /// Report as a readable block
    pub fn to_summary(report: &StatsReport) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Replay Report: {}", report.run_id));
        lines.push(format!(
            "Duration: {}ms",
            (report.finished_at - report.started_at).num_milliseconds()
        ));
        lines.push(format!("Ops: {}", report.ops_recorded));
        lines.push(format!("Ops with errors: {}", report.ops_with_errors));

        lines.push(String::new());
        lines.push("Latency:".to_string());
        lines.push(format!("  Mean: {}us", report.mean_latency_us));
        lines.push(format!("  Max: {}us", report.max_latency_us));

        lines.join("\n")
    }
}
