use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::{ResourceKind, ScanJobHandle, TerminalStatus, WorkloadPhase};
use crate::operator::client::SharedClient;
use crate::orchestrator::Error;

/// Polls a submitted workload until it reaches a terminal status.
pub struct JobMonitor {
    client: SharedClient,
    poll_interval: Duration,
}

impl JobMonitor {
    pub fn new(client: SharedClient, poll_interval: Duration) -> JobMonitor {
        JobMonitor {
            client,
            poll_interval,
        }
    }

    /// One status probe.
    pub async fn observe(&self, handle: &ScanJobHandle) -> Result<WorkloadPhase, Error> {
        let job = self
            .client
            .get(ResourceKind::Job, &handle.name, Some(&handle.namespace))
            .await?;
        Ok(phase_of(&job))
    }

    /// Waits until the workload is complete or failed, or `timeout` elapses.
    ///
    /// Timing out leaves the workload untouched; tearing it down is the
    /// caller's decision.
    pub async fn monitor(
        &self,
        handle: &ScanJobHandle,
        timeout: Duration,
    ) -> Result<TerminalStatus, Error> {
        match tokio::time::timeout(timeout, self.poll_until_terminal(handle)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} still running after {:?}", handle, timeout);
                Err(Error::Timeout {
                    name: handle.name.clone(),
                    namespace: handle.namespace.clone(),
                    waited: timeout,
                })
            }
        }
    }

    async fn poll_until_terminal(&self, handle: &ScanJobHandle) -> Result<TerminalStatus, Error> {
        loop {
            match self.observe(handle).await? {
                WorkloadPhase::Terminal(status) => {
                    info!("{} reached terminal status {}", handle, status);
                    return Ok(status);
                }
                WorkloadPhase::Running => {
                    debug!("{} still running", handle.name);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// Job controller default for `spec.backoffLimit`.
const DEFAULT_BACKOFF_LIMIT: i64 = 6;

/// Reads a Job's phase from its status conditions, falling back to the pod
/// counters when no condition has been written yet.
pub fn phase_of(job: &Value) -> WorkloadPhase {
    let status = &job["status"];
    if let Some(conditions) = status["conditions"].as_array() {
        for condition in conditions {
            if condition["status"] != "True" {
                continue;
            }
            match condition["type"].as_str() {
                Some("Complete") => return WorkloadPhase::Terminal(TerminalStatus::Complete),
                Some("Failed") => return WorkloadPhase::Terminal(TerminalStatus::Failed),
                _ => {}
            }
        }
    }

    let active = status["active"].as_i64().unwrap_or(0);
    let succeeded = status["succeeded"].as_i64().unwrap_or(0);
    let failed = status["failed"].as_i64().unwrap_or(0);
    let backoff_limit = job["spec"]["backoffLimit"]
        .as_i64()
        .unwrap_or(DEFAULT_BACKOFF_LIMIT);
    if active == 0 && succeeded > 0 {
        return WorkloadPhase::Terminal(TerminalStatus::Complete);
    }
    if active == 0 && failed > backoff_limit {
        return WorkloadPhase::Terminal(TerminalStatus::Failed);
    }
    WorkloadPhase::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::fake::FakeCluster;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn handle() -> ScanJobHandle {
        ScanJobHandle {
            name: "tls-scanner-job".into(),
            namespace: "scan-1".into(),
            image_reference: "registry/example:v1".into(),
        }
    }

    fn cluster_with_job() -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert(
            ResourceKind::Job,
            "tls-scanner-job",
            Some("scan-1"),
            json!({"kind": "Job", "metadata": {"name": "tls-scanner-job", "namespace": "scan-1"}}),
        );
        cluster
    }

    fn running() -> Value {
        json!({"active": 1})
    }

    fn condition(kind: &str) -> Value {
        json!({"conditions": [{"type": kind, "status": "True"}]})
    }

    #[test]
    fn conditions_decide_the_phase() {
        assert_eq!(
            phase_of(&json!({"status": condition("Complete")})),
            WorkloadPhase::Terminal(TerminalStatus::Complete)
        );
        assert_eq!(
            phase_of(&json!({"status": condition("Failed")})),
            WorkloadPhase::Terminal(TerminalStatus::Failed)
        );
        assert_eq!(
            phase_of(&json!({"status": {"conditions": [{"type": "Failed", "status": "False"}], "active": 1}})),
            WorkloadPhase::Running
        );
    }

    #[test]
    fn counters_are_a_fallback() {
        assert_eq!(
            phase_of(&json!({"status": {"succeeded": 1}})),
            WorkloadPhase::Terminal(TerminalStatus::Complete)
        );
        assert_eq!(phase_of(&json!({})), WorkloadPhase::Running);
        assert_eq!(phase_of(&json!({"status": running()})), WorkloadPhase::Running);
    }

    #[test]
    fn failures_past_the_backoff_limit_are_terminal() {
        assert_eq!(
            phase_of(&json!({"spec": {"backoffLimit": 0}, "status": {"failed": 1, "active": 0}})),
            WorkloadPhase::Terminal(TerminalStatus::Failed)
        );
        assert_eq!(
            phase_of(&json!({"spec": {"backoffLimit": 2}, "status": {"failed": 2, "active": 0}})),
            WorkloadPhase::Running
        );
        // A retry pod is still running.
        assert_eq!(
            phase_of(&json!({"spec": {"backoffLimit": 0}, "status": {"failed": 1, "active": 1}})),
            WorkloadPhase::Running
        );
        // No backoffLimit means the controller default of six retries.
        assert_eq!(
            phase_of(&json!({"status": {"failed": 6}})),
            WorkloadPhase::Running
        );
        assert_eq!(
            phase_of(&json!({"status": {"failed": 7}})),
            WorkloadPhase::Terminal(TerminalStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_end_monitoring_without_a_condition() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert(
            ResourceKind::Job,
            "tls-scanner-job",
            Some("scan-1"),
            json!({"kind": "Job", "metadata": {"name": "tls-scanner-job", "namespace": "scan-1"}, "spec": {"backoffLimit": 0}}),
        );
        cluster.script_job_statuses(vec![running(), json!({"active": 0, "failed": 1})]);
        let monitor = JobMonitor::new(cluster, Duration::from_secs(10));

        let status = monitor
            .monitor(&handle(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(status, TerminalStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_the_workload_completes() {
        let cluster = cluster_with_job();
        cluster.script_job_statuses(vec![running(), running(), condition("Complete")]);
        let monitor = JobMonitor::new(cluster.clone(), Duration::from_secs(10));

        let started = Instant::now();
        let status = monitor
            .monitor(&handle(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(status, TerminalStatus::Complete);
        assert_eq!(cluster.calls_starting_with("get Job").len(), 3);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_workload_is_terminal() {
        let cluster = cluster_with_job();
        cluster.script_job_statuses(vec![running(), condition("Failed")]);
        let monitor = JobMonitor::new(cluster, Duration::from_secs(10));

        let status = monitor
            .monitor(&handle(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(status, TerminalStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn never_finishing_workload_times_out() {
        let cluster = cluster_with_job();
        cluster.script_job_statuses(vec![running()]);
        let monitor = JobMonitor::new(cluster.clone(), Duration::from_secs(10));

        let err = monitor
            .monitor(&handle(), Duration::from_secs(45))
            .await
            .unwrap_err();

        match err {
            Error::Timeout { name, waited, .. } => {
                assert_eq!(name, "tls-scanner-job");
                assert_eq!(waited, Duration::from_secs(45));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(cluster.exists(ResourceKind::Job, "tls-scanner-job", Some("scan-1")));
    }

    #[tokio::test]
    async fn missing_workload_is_not_found() {
        let monitor = JobMonitor::new(Arc::new(FakeCluster::new()), Duration::from_millis(10));
        let err = monitor
            .monitor(&handle(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
