//! 脚本化规划器：按顺序返回预置响应并记录收到的请求（测试与离线运行用）

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::oracle::{parse_plan_text, parse_revision_text, OracleError, OracleRequest, OracleResponse, PlanOracle};
use crate::plan::{PlanDocument, PlanRevision};

#[derive(Default)]
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<Result<OracleResponse, OracleError>>>,
    requests: Mutex<Vec<OracleRequest>>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次响应前等待，模拟慢速规划
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Result<OracleResponse, OracleError>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }

    pub fn push_plan(&self, doc: PlanDocument) -> &Self {
        self.push(Ok(OracleResponse::Plan(doc)))
    }

    pub fn push_revision(&self, revision: PlanRevision) -> &Self {
        self.push(Ok(OracleResponse::Revision(revision)))
    }

    /// 预置一段规划器原文（计划）
    pub fn push_plan_text(&self, text: &str) -> &Self {
        self.push(parse_plan_text(text).map(OracleResponse::Plan))
    }

    /// 预置一段规划器原文（修订）
    pub fn push_revision_text(&self, text: &str) -> &Self {
        self.push(parse_revision_text(text).map(OracleResponse::Revision))
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn revision_requests(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, OracleRequest::SubtreeRevision(_)))
            .count()
    }
}

#[async_trait]
impl PlanOracle for ScriptedOracle {
    async fn respond(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
        let is_initial = matches!(request, OracleRequest::InitialPlan(_));
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(response) => response,
            None if is_initial => Err(OracleError::Unavailable("script exhausted".into())),
            None => Ok(OracleResponse::NoRevision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, StepError};
    use crate::oracle::RevisionRequest;

    fn revision_request() -> OracleRequest {
        OracleRequest::SubtreeRevision(RevisionRequest {
            task_id: "t".into(),
            plan_id: "p".into(),
            plan_version: 1,
            failed_step: "a".into(),
            subtree: Vec::new(),
            error: StepError::new(ErrorKind::Permanent, "boom"),
            history: String::new(),
            completed: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let oracle = ScriptedOracle::new();
        oracle
            .push_revision_text(r#"{"steps": [], "reasoning": "drop it"}"#)
            .push(Err(OracleError::Unavailable("down".into())));

        assert!(matches!(
            oracle.respond(revision_request()).await,
            Ok(OracleResponse::Revision(r)) if r.reasoning == "drop it"
        ));
        assert!(oracle.respond(revision_request()).await.is_err());
        assert_eq!(oracle.respond(revision_request()).await, Ok(OracleResponse::NoRevision));
        assert_eq!(oracle.revision_requests(), 3);
    }
}
