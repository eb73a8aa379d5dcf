//! 计划依赖图
//!
//! 使用邻接表（步骤 -> 依赖它的步骤）和入度表实现 DAG 校验与就绪计算。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::plan::types::*;

/// 计划依赖图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
    /// 文档顺序
    order: Vec<StepId>,
    dependencies: HashMap<StepId, Vec<StepId>>,
}

impl PlanGraph {
    /// 构建依赖图；调用前应先通过 validate
    pub fn new(steps: &[Arc<StepDefinition>]) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut dependencies = HashMap::new();

        for step in steps {
            in_degree.insert(step.step_id.clone(), 0);
            adjacency.entry(step.step_id.clone()).or_default();
        }

        for step in steps {
            let mut seen = HashSet::new();
            for dep in &step.depends_on {
                if !seen.insert(dep) {
                    continue;
                }
                adjacency.entry(dep.clone()).or_default().push(step.step_id.clone());
                *in_degree.entry(step.step_id.clone()).or_insert(0) += 1;
            }
            dependencies.insert(
                step.step_id.clone(),
                step.depends_on.iter().cloned().collect::<Vec<_>>(),
            );
        }

        Self {
            adjacency,
            in_degree,
            order: steps.iter().map(|s| s.step_id.clone()).collect(),
            dependencies,
        }
    }

    /// 校验：空 id、重复 id、悬空引用、环
    pub fn validate(steps: &[Arc<StepDefinition>]) -> Result<(), PlanError> {
        let mut ids = HashSet::new();
        for step in steps {
            if step.step_id.trim().is_empty() {
                return Err(PlanError::EmptyStepId);
            }
            if !ids.insert(step.step_id.as_str()) {
                return Err(PlanError::DuplicateStep(step.step_id.clone()));
            }
        }
        for step in steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::DanglingReference {
                        step: step.step_id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let graph = Self::new(steps);
        if graph.topological_order().len() != steps.len() {
            return Err(PlanError::Cycle(graph.find_cycle()));
        }
        Ok(())
    }

    /// Kahn 拓扑排序；存在环时返回的序列短于步骤数
    pub fn topological_order(&self) -> Vec<StepId> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }
        sorted
    }

    /// 深度优先找出一条环路径（首尾相同），用于错误说明
    fn find_cycle(&self) -> Vec<StepId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &PlanGraph,
            id: &StepId,
            marks: &mut HashMap<StepId, Mark>,
            stack: &mut Vec<StepId>,
        ) -> Option<Vec<StepId>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|s| s == id).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(id.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(id.clone(), Mark::Visiting);
            stack.push(id.clone());
            for dep in graph.dependencies_of(id) {
                if let Some(cycle) = visit(graph, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(id.clone(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for id in &self.order {
            let mut stack = Vec::new();
            if let Some(mut cycle) = visit(self, id, &mut marks, &mut stack) {
                // 依赖方向 -> 执行方向
                cycle.reverse();
                return cycle;
            }
        }
        Vec::new()
    }

    pub fn dependencies_of(&self, step_id: &str) -> &[StepId] {
        self.dependencies.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, step_id: &str) -> &[StepId] {
        self.adjacency.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 所有传递依赖方（不含自身），按文档顺序
    pub fn descendants(&self, step_id: &str) -> Vec<StepId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        while let Some(id) = queue.pop_front() {
            for dependent in self.dependents_of(id) {
                if seen.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(id.as_str()) && id.as_str() != step_id)
            .cloned()
            .collect()
    }

    /// 可执行的步骤：尚未开始，且每个依赖都已成功或带放行标注地结束；按文档顺序返回
    pub fn ready_steps(&self, records: &HashMap<StepId, StepRecord>) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                records.get(*id).map(|r| r.status.is_unstarted()).unwrap_or(false)
                    && self.dependencies_of(id).iter().all(|dep| {
                        records.get(dep).map(|r| r.satisfies_dependents()).unwrap_or(false)
                    })
            })
            .cloned()
            .collect()
    }

    pub fn order(&self) -> &[StepId] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> Arc<StepDefinition> {
        Arc::new(StepDefinition::new(id, "echo", json!({})).depends_on(deps.iter().copied()))
    }

    fn records(steps: &[Arc<StepDefinition>]) -> HashMap<StepId, StepRecord> {
        steps
            .iter()
            .map(|s| (s.step_id.clone(), StepRecord::new(Arc::clone(s), 1, 3)))
            .collect()
    }

    #[test]
    fn test_graph_construction() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        let graph = PlanGraph::new(&steps);
        assert_eq!(graph.in_degree.get("a"), Some(&0));
        assert_eq!(graph.in_degree.get("c"), Some(&2));
        assert_eq!(graph.dependents_of("a"), &["b".to_string(), "c".to_string()]);
        assert_eq!(graph.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate_cycle() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        match PlanGraph::validate(&steps) {
            Err(PlanError::Cycle(path)) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_self_dependency() {
        let steps = vec![step("a", &["a"])];
        assert!(matches!(PlanGraph::validate(&steps), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn test_validate_dangling_and_duplicate() {
        let steps = vec![step("a", &[]), step("b", &["zzz"])];
        assert_eq!(
            PlanGraph::validate(&steps),
            Err(PlanError::DanglingReference {
                step: "b".into(),
                missing: "zzz".into()
            })
        );

        let steps = vec![step("a", &[]), step("a", &[])];
        assert_eq!(PlanGraph::validate(&steps), Err(PlanError::DuplicateStep("a".into())));
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])];
        let graph = PlanGraph::new(&steps);
        let mut recs = records(&steps);

        assert_eq!(graph.ready_steps(&recs), vec!["a", "b"]);

        recs.get_mut("a").unwrap().transition(StepStatus::Succeeded);
        assert_eq!(graph.ready_steps(&recs), vec!["b"]);

        recs.get_mut("b").unwrap().transition(StepStatus::Succeeded);
        assert_eq!(graph.ready_steps(&recs), vec!["c"]);
    }

    #[test]
    fn test_descendants() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ];
        let graph = PlanGraph::new(&steps);
        assert_eq!(graph.descendants("a"), vec!["b", "c"]);
        assert!(graph.descendants("d").is_empty());
    }
}
