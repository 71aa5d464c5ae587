//! Health assessment derived from queue statistics.

use serde::{Deserialize, Serialize};

use crate::core::QueueEntry;

use super::calculator::{format_age, QueueStatistics, QueueStatisticsCalculator};

/// Overall verdict.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Good,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Good => "good",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Limits the monitor checks against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthThresholds {
    pub critical_size: usize,
    pub warning_size: usize,
    pub max_processing_ratio: f64,
    /// Seconds.
    pub max_average_age: f64,
    pub max_failure_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            critical_size: 1000,
            warning_size: 500,
            max_processing_ratio: 0.5,
            max_average_age: 3600.0,
            max_failure_rate: 0.10,
        }
    }
}

/// Result of a health check.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthStatus {
    pub overall_health: HealthLevel,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub statistics: QueueStatistics,
}

impl HealthStatus {
    pub fn is_good(&self) -> bool {
        self.overall_health == HealthLevel::Good
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Health: {}", self.overall_health)?;
        for issue in &self.issues {
            write!(f, "\n  ! {}", issue)?;
        }
        for recommendation in &self.recommendations {
            write!(f, "\n  > {}", recommendation)?;
        }
        Ok(())
    }
}

/// A single check's outcome.
struct Finding {
    critical: bool,
    issue: String,
    recommendation: String,
}

/// Turns statistics into a good/warning/critical verdict.
#[derive(Debug, Clone, Default)]
pub struct QueueHealthMonitor {
    thresholds: HealthThresholds,
}

impl QueueHealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Assess an entry set as of now.
    pub fn check(&self, entries: &[QueueEntry]) -> HealthStatus {
        self.assess(QueueStatisticsCalculator::calculate(entries))
    }

    /// Assess precomputed statistics.
    pub fn assess(&self, statistics: QueueStatistics) -> HealthStatus {
        let findings: Vec<Finding> = [
            self.check_size(&statistics),
            self.check_processing(&statistics),
            self.check_age(&statistics),
            self.check_failures(&statistics),
        ]
        .into_iter()
        .flatten()
        .collect();

        let overall_health = if findings.is_empty() {
            HealthLevel::Good
        } else if findings.len() >= 2 || findings.iter().any(|f| f.critical) {
            HealthLevel::Critical
        } else {
            HealthLevel::Warning
        };

        let (issues, recommendations): (Vec<String>, Vec<String>) = findings
            .into_iter()
            .map(|f| (f.issue, f.recommendation))
            .unzip();

        HealthStatus {
            overall_health,
            issues,
            recommendations,
            statistics,
        }
    }

    fn check_size(&self, stats: &QueueStatistics) -> Option<Finding> {
        let t = &self.thresholds;
        if stats.total_entries > t.critical_size {
            Some(Finding {
                critical: true,
                issue: format!(
                    "Queue size critical: {} entries (limit {})",
                    stats.total_entries, t.critical_size
                ),
                recommendation: "Drain the backlog and run cleanup; check that the processor is running"
                    .to_string(),
            })
        } else if stats.total_entries > t.warning_size {
            Some(Finding {
                critical: false,
                issue: format!(
                    "Queue size elevated: {} entries (warning at {})",
                    stats.total_entries, t.warning_size
                ),
                recommendation: "Increase processing batch size or run cleanup more often".to_string(),
            })
        } else {
            None
        }
    }

    fn check_processing(&self, stats: &QueueStatistics) -> Option<Finding> {
        let ratio = stats.processing_ratio();
        if ratio <= self.thresholds.max_processing_ratio {
            return None;
        }
        Some(Finding {
            critical: false,
            issue: format!(
                "{} of {} entries stuck in PROCESSING ({:.0}%)",
                stats.processing_entries,
                stats.total_entries,
                ratio * 100.0
            ),
            recommendation: "Workers may have crashed mid-delivery; inspect and recover stuck entries"
                .to_string(),
        })
    }

    fn check_age(&self, stats: &QueueStatistics) -> Option<Finding> {
        let average = stats.average_age?;
        if average <= self.thresholds.max_average_age {
            return None;
        }
        Some(Finding {
            critical: false,
            issue: format!(
                "Messages are aging: average age {} (limit {})",
                format_age(average),
                format_age(self.thresholds.max_average_age)
            ),
            recommendation: "Check delivery throughput and lower max_age_days if old entries are not needed"
                .to_string(),
        })
    }

    fn check_failures(&self, stats: &QueueStatistics) -> Option<Finding> {
        let rate = stats.failure_rate();
        if rate <= self.thresholds.max_failure_rate {
            return None;
        }
        Some(Finding {
            critical: false,
            issue: format!(
                "High failure rate: {} of {} entries failed ({:.0}%)",
                stats.failed_entries,
                stats.total_entries,
                rate * 100.0
            ),
            recommendation: "Inspect last_error on failed entries and check the delivery target".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn delivered(n: usize) -> Vec<QueueEntry> {
        (0..n)
            .map(|i| {
                let mut entry = QueueEntry::new(json!(i), 0.5);
                entry.mark_delivered(Utc::now());
                entry
            })
            .collect()
    }

    #[test]
    fn test_small_delivered_set_is_good() {
        let health = QueueHealthMonitor::default().check(&delivered(5));

        assert_eq!(health.overall_health, HealthLevel::Good);
        assert!(health.issues.is_empty());
        assert!(health.recommendations.is_empty());
        assert_eq!(health.statistics.delivered_entries, 5);
    }

    #[test]
    fn test_empty_queue_is_good() {
        let health = QueueHealthMonitor::default().check(&[]);
        assert!(health.is_good());
    }

    #[test]
    fn test_oversized_queue() {
        let health = QueueHealthMonitor::default().check(&delivered(1001));

        assert_eq!(health.overall_health, HealthLevel::Critical);
        assert_eq!(health.issues.len(), 1);
        assert!(health.issues[0].contains("critical"));
    }

    #[test]
    fn test_elevated_size_is_warning() {
        let health = QueueHealthMonitor::default().check(&delivered(501));

        assert_eq!(health.overall_health, HealthLevel::Warning);
        assert_eq!(health.issues.len(), 1);
        assert_eq!(health.recommendations.len(), 1);
    }

    #[test]
    fn test_stuck_processing() {
        let mut entries = delivered(2);
        for i in 0..3 {
            let mut entry = QueueEntry::new(json!(i), 0.5);
            entry.mark_processing(Utc::now());
            entries.push(entry);
        }

        let health = QueueHealthMonitor::default().check(&entries);
        assert_eq!(health.overall_health, HealthLevel::Warning);
        assert!(health.issues[0].contains("PROCESSING"));
    }

    #[test]
    fn test_multiple_issues_escalate() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(3);
        let entries: Vec<QueueEntry> = (0..4)
            .map(|i| {
                let mut entry = QueueEntry::new_at(json!(i), 0.5, old);
                entry.mark_failed("refused", now);
                entry
            })
            .collect();

        let health = QueueHealthMonitor::default().check(&entries);

        assert_eq!(health.overall_health, HealthLevel::Critical);
        assert_eq!(health.issues.len(), 2);
        assert!(health.issues.iter().any(|i| i.contains("aging")));
        assert!(health.issues.iter().any(|i| i.contains("failure rate")));
    }

    #[test]
    fn test_custom_thresholds() {
        let monitor = QueueHealthMonitor::new(HealthThresholds {
            warning_size: 2,
            ..HealthThresholds::default()
        });

        let health = monitor.check(&delivered(3));
        assert_eq!(health.overall_health, HealthLevel::Warning);
    }

    #[test]
    fn test_serialized_level_is_lowercase() {
        let health = QueueHealthMonitor::default().check(&[]);
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["overall_health"], "good");
    }
}
