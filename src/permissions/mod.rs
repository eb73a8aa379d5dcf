//! 权限：授权、交互确认、限流与紧急停止

pub mod gate;

pub use gate::{
    effective_scope, Authorization, DenyReason, GateError, GatePolicy, PermissionGate, PermissionGrant, Subject,
};
