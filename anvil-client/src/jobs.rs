//! Job-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use anvil_core::domain::job::JobRecord;
use anvil_core::dto::job::{
    PollJob, PollJobResponse, QuoteRequest, QuoteResponse, SubmitJob, SubmitJobResponse,
};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Submission
    // =============================================================================

    /// Get the routing decision and cost estimate for a prospective job
    ///
    /// Nothing is created on the orchestrator side.
    pub async fn quote_job(&self, req: &QuoteRequest) -> Result<QuoteResponse> {
        self.send(self.client.post(self.url("/job/quote")).json(req)).await
    }

    /// Submit a training job
    ///
    /// # Arguments
    /// * `req` - The submission; set `idempotency_key` to make retries safe
    ///
    /// # Returns
    /// The job id and the estimate it was accepted with
    ///
    /// # Example
    /// ```no_run
    /// # use anvil_client::OrchestratorClient;
    /// # use anvil_core::dto::job::SubmitJob;
    /// # async fn example(req: SubmitJob) -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let submitted = client.submit_job(&req).await?;
    /// println!("job {} (~{} min)", submitted.job_id, submitted.estimated_minutes);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit_job(&self, req: &SubmitJob) -> Result<SubmitJobResponse> {
        self.send(self.client.post(self.url("/job/submit")).json(req)).await
    }

    // =============================================================================
    // Inspection
    // =============================================================================

    /// Get a job by ID
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobRecord> {
        self.send(self.client.get(self.url(&format!("/job/{}", job_id)))).await
    }

    /// List the jobs of a project, newest first
    pub async fn list_jobs_by_project(&self, project_id: &str) -> Result<Vec<JobRecord>> {
        self.send(self.client.get(self.url(&format!("/job/project/{}", project_id))))
            .await
    }

    /// Ask the orchestrator to reconcile a job now
    pub async fn poll_job(&self, job_id: Uuid, project_id: &str) -> Result<PollJobResponse> {
        let body = PollJob {
            job_id,
            project_id: project_id.to_string(),
        };
        self.send(self.client.post(self.url("/job/poll")).json(&body)).await
    }

    // =============================================================================
    // Cancellation
    // =============================================================================

    /// Cancel a job; cancelling a finished job succeeds without effect
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.send_empty(self.client.post(self.url(&format!("/job/{}/cancel", job_id))))
            .await
    }
}
