use serde::{Deserialize, Serialize};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct TriggerJobRequest {
    #[serde(default)]
    pub job: String,
}

impl TriggerJobRequest {
    /// The job name to trigger, or a reason why the request is unusable.
    pub fn validate(&self) -> Result<&str, &'static str> {
        let job = self.job.trim();
        if job.is_empty() {
            return Err("job is required");
        }
        Ok(job)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerJobResponse {
    pub job: String,
    pub message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub status: &'static str,
    pub cache_dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RecentTasksResponse {
    pub tasks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_job_names_are_rejected() {
        let req: TriggerJobRequest = serde_json::from_str(r#"{"job":"   "}"#).unwrap();
        assert_eq!(req.validate(), Err("job is required"));

        let req: TriggerJobRequest = serde_json::from_str("{}").unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn job_names_are_trimmed() {
        let req: TriggerJobRequest =
            serde_json::from_str(r#"{"job":" CronSendLittleMessage "}"#).unwrap();
        assert_eq!(req.validate(), Ok("CronSendLittleMessage"));
    }
}
