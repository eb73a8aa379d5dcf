//! 计划模块
//!
//! - types: 计划文档、不可变计划版本、步骤运行时记录
//! - graph: 依赖图校验与就绪计算
//! - revision: 失败子树修订与版本拼接
//! - template: 步骤间结果传递的参数模板
//! - builder: 代码内构建计划

pub mod builder;
pub mod graph;
pub mod revision;
pub mod template;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use revision::{failed_subtree, splice, PlanRevision, SplicedPlan};
pub use template::resolve_arguments;
pub use types::*;
