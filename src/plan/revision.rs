//! 计划修订：失败子树提取与版本拼接
//!
//! 修订从不原地修改当前计划：拼接生成新版本，未受影响的步骤定义按 Arc 共享，
//! 已成功的步骤及其结果保留，不会重新执行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::graph::PlanGraph;
use crate::plan::types::*;

/// 规划器针对失败子树给出的修订
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanRevision {
    /// 替换失败子树的新步骤；为空表示放弃该子树
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub reasoning: String,
}

/// 拼接结果
#[derive(Debug, Clone)]
pub struct SplicedPlan {
    pub plan: Plan,
    /// 被移除的子树步骤
    pub removed: Vec<StepId>,
    /// 新加入的步骤
    pub added: Vec<StepId>,
    /// 修订中与已成功步骤同名、因此被忽略的步骤
    pub preserved: Vec<StepId>,
}

/// 失败步骤 + 其尚未运行的传递依赖方
pub fn failed_subtree(graph: &PlanGraph, records: &HashMap<StepId, StepRecord>, failed: &str) -> Vec<StepId> {
    let mut subtree = vec![failed.to_string()];
    subtree.extend(
        graph
            .descendants(failed)
            .into_iter()
            .filter(|id| records.get(id).map(|r| r.status.is_unstarted()).unwrap_or(false)),
    );
    subtree
}

/// 用 revision 替换 subtree，生成 version + 1 的新计划并校验
pub fn splice(
    plan: &Plan,
    records: &HashMap<StepId, StepRecord>,
    subtree: &[StepId],
    revision: PlanRevision,
    max_steps: usize,
) -> Result<SplicedPlan, PlanError> {
    let removed: HashSet<&str> = subtree.iter().map(String::as_str).collect();
    let retained: Vec<Arc<StepDefinition>> = plan
        .steps
        .iter()
        .filter(|s| !removed.contains(s.step_id.as_str()))
        .cloned()
        .collect();
    let retained_ids: HashSet<&str> = retained.iter().map(|s| s.step_id.as_str()).collect();

    let mut added = Vec::new();
    let mut preserved = Vec::new();
    let mut steps = retained.clone();
    for step in revision.steps {
        if retained_ids.contains(step.step_id.as_str()) {
            let succeeded = records
                .get(&step.step_id)
                .map(|r| r.status == StepStatus::Succeeded)
                .unwrap_or(false);
            if succeeded {
                preserved.push(step.step_id);
                continue;
            }
            return Err(PlanError::DuplicateStep(step.step_id));
        }
        added.push(step.step_id.clone());
        steps.push(Arc::new(step));
    }

    let next = Plan {
        id: plan.id.clone(),
        task_id: plan.task_id.clone(),
        version: plan.version + 1,
        goal: plan.goal.clone(),
        steps,
    };
    next.validate(max_steps)?;

    Ok(SplicedPlan {
        plan: next,
        removed: subtree.to_vec(),
        added,
        preserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(steps: Vec<StepDefinition>) -> Plan {
        Plan {
            id: "p".into(),
            task_id: "t".into(),
            version: 1,
            goal: String::new(),
            steps: steps.into_iter().map(Arc::new).collect(),
        }
    }

    fn records(plan: &Plan) -> HashMap<StepId, StepRecord> {
        plan.steps
            .iter()
            .map(|s| (s.step_id.clone(), StepRecord::new(Arc::clone(s), plan.version, 3)))
            .collect()
    }

    #[test]
    fn test_subtree_excludes_started_and_unrelated() {
        let p = plan(vec![
            StepDefinition::new("a", "echo", json!({})),
            StepDefinition::new("b", "echo", json!({})).depends_on(["a"]),
            StepDefinition::new("c", "echo", json!({})).depends_on(["b"]),
            StepDefinition::new("d", "echo", json!({})),
        ]);
        let graph = PlanGraph::new(&p.steps);
        let mut recs = records(&p);
        recs.get_mut("a").unwrap().transition(StepStatus::Failed);
        assert_eq!(failed_subtree(&graph, &recs, "a"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_splice_shares_unaffected_steps() {
        let p = plan(vec![
            StepDefinition::new("a", "echo", json!({})),
            StepDefinition::new("b", "send_email", json!({})).depends_on(["a"]),
        ]);
        let mut recs = records(&p);
        recs.get_mut("a").unwrap().transition(StepStatus::Succeeded);
        recs.get_mut("b").unwrap().transition(StepStatus::Failed);

        let revision = PlanRevision {
            steps: vec![
                // 与已成功的 a 同名：保留原结果，不重复执行
                StepDefinition::new("a", "echo", json!({"text": "again"})),
                StepDefinition::new("b2", "send_sms", json!({})).depends_on(["a"]),
            ],
            reasoning: "email bounced, fall back to sms".into(),
        };
        let spliced = splice(&p, &recs, &["b".to_string()], revision, 10).unwrap();

        assert_eq!(spliced.plan.version, 2);
        assert_eq!(spliced.plan.step_ids(), vec!["a", "b2"]);
        assert_eq!(spliced.preserved, vec!["a"]);
        assert_eq!(spliced.added, vec!["b2"]);
        assert!(Arc::ptr_eq(&p.steps[0], &spliced.plan.steps[0]));
    }

    #[test]
    fn test_splice_rejects_dangling_into_removed_subtree() {
        let p = plan(vec![
            StepDefinition::new("a", "echo", json!({})),
            StepDefinition::new("b", "echo", json!({})).depends_on(["a"]),
        ]);
        let recs = records(&p);
        let revision = PlanRevision {
            steps: vec![StepDefinition::new("x", "echo", json!({})).depends_on(["b"])],
            reasoning: String::new(),
        };
        let err = splice(&p, &recs, &["b".to_string()], revision, 10).unwrap_err();
        assert!(matches!(err, PlanError::DanglingReference { .. }));
    }

    #[test]
    fn test_splice_rejects_clash_with_pending_step() {
        let p = plan(vec![
            StepDefinition::new("a", "echo", json!({})),
            StepDefinition::new("b", "echo", json!({})),
        ]);
        let recs = records(&p);
        let revision = PlanRevision {
            steps: vec![StepDefinition::new("a", "echo", json!({}))],
            reasoning: String::new(),
        };
        let err = splice(&p, &recs, &["b".to_string()], revision, 10).unwrap_err();
        assert_eq!(err, PlanError::DuplicateStep("a".into()));
    }

    #[test]
    fn test_empty_revision_drops_subtree() {
        let p = plan(vec![
            StepDefinition::new("a", "echo", json!({})),
            StepDefinition::new("b", "echo", json!({})).depends_on(["a"]),
        ]);
        let recs = records(&p);
        let revision = PlanRevision {
            steps: Vec::new(),
            reasoning: "not needed".into(),
        };
        let spliced = splice(&p, &recs, &["a".to_string(), "b".to_string()], revision, 10).unwrap();
        assert!(spliced.plan.steps.is_empty());
        assert_eq!(spliced.removed, vec!["a", "b"]);
    }
}
