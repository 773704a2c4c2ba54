//! Prometheus exporter for mirror jobs
//!
//! Renders [`JobStatus`] snapshots in the Prometheus text exposition format.
//!
//! # Prometheus Metrics
//!
//! - `objectio_mirror_bytes_total` - Bytes done plus in flight plus dirty
//! - `objectio_mirror_bytes_remaining` - Bytes still to copy
//! - `objectio_mirror_bytes_done` - Bytes copied by completed operations
//! - `objectio_mirror_in_flight_ops` - Operations currently executing
//! - `objectio_mirror_synced` - 1 when the target is in sync
//! - `objectio_mirror_paused` - 1 while the job is paused
//! - `objectio_mirror_speed_bytes` - Speed limit (0 = unlimited)
//! - `objectio_mirror_error` - 1 when the job has recorded an error
//! - `objectio_mirror_phase` - 1 for the job's current phase, labelled by phase

use std::fmt::Write;

use crate::job::JobStatus;

#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "objectio")
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export job metrics in Prometheus text format
    pub fn export(&self, jobs: &[JobStatus]) -> String {
        let mut output = String::with_capacity(1024 + jobs.len() * 512);
        if jobs.is_empty() {
            return output;
        }

        let gauges: [(&str, &str, fn(&JobStatus) -> f64); 8] = [
            (
                "mirror_bytes_total",
                "Bytes done, in flight and dirty",
                |s| s.bytes_total as f64,
            ),
            (
                "mirror_bytes_remaining",
                "Bytes still to copy",
                |s| s.bytes_remaining as f64,
            ),
            (
                "mirror_bytes_done",
                "Bytes copied by completed operations",
                |s| s.bytes_done as f64,
            ),
            (
                "mirror_in_flight_ops",
                "Operations currently executing",
                |s| s.in_flight as f64,
            ),
            ("mirror_synced", "Target in sync with source", |s| {
                flag(s.synced)
            }),
            ("mirror_paused", "Job paused", |s| flag(s.paused)),
            (
                "mirror_speed_bytes",
                "Speed limit in bytes per second (0 = unlimited)",
                |s| s.speed as f64,
            ),
            ("mirror_error", "Job has recorded an error", |s| {
                flag(s.last_error.is_some())
            }),
        ];

        for (name, help, value) in gauges {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "gauge");
            for job in jobs {
                self.write_metric_with_labels(
                    &mut output,
                    name,
                    value(job),
                    &[("job_id", &job.job_id)],
                );
            }
        }

        self.write_help(&mut output, "mirror_phase", "Current job phase");
        self.write_type(&mut output, "mirror_phase", "gauge");
        for job in jobs {
            self.write_metric_with_labels(
                &mut output,
                "mirror_phase",
                1.0,
                &[("job_id", &job.job_id), ("phase", job.phase.as_str())],
            );
        }

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("objectio")
    }
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::job::MirrorPhase;

    fn status(job_id: &str) -> JobStatus {
        JobStatus {
            job_id: job_id.to_string(),
            phase: MirrorPhase::Iterating,
            bytes_total: 100 * 1024 * 1024,
            bytes_remaining: 60 * 1024 * 1024,
            bytes_done: 40 * 1024 * 1024,
            in_flight: 7,
            synced: false,
            paused: false,
            speed: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_prometheus_export() {
        let mut ready = status("vm1-disk0");
        ready.phase = MirrorPhase::Ready;
        ready.synced = true;
        ready.last_error = Some(MirrorError::Internal("boom".to_string()));

        let exporter = PrometheusExporter::default();
        let output = exporter.export(&[status("vm0-disk0"), ready]);

        assert!(output.contains("# TYPE objectio_mirror_bytes_total gauge"));
        assert!(output.contains("objectio_mirror_bytes_total{job_id=\"vm0-disk0\"} 104857600"));
        assert!(output.contains("objectio_mirror_in_flight_ops{job_id=\"vm0-disk0\"} 7"));
        assert!(output.contains("objectio_mirror_synced{job_id=\"vm1-disk0\"} 1"));
        assert!(output.contains("objectio_mirror_error{job_id=\"vm0-disk0\"} 0"));
        assert!(output.contains("objectio_mirror_error{job_id=\"vm1-disk0\"} 1"));
        assert!(output.contains(
            "objectio_mirror_phase{job_id=\"vm1-disk0\",phase=\"ready\"} 1"
        ));
    }

    #[test]
    fn test_empty_export() {
        assert!(PrometheusExporter::new("test").export(&[]).is_empty());
    }

    #[test]
    fn test_label_escaping() {
        let output = PrometheusExporter::new("t").export(&[status("a\"b")]);
        assert!(output.contains("t_mirror_paused{job_id=\"a\\\"b\"} 0"));
    }
}
