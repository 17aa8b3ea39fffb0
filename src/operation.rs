//! The smallest executable unit: one request or one function call

use crate::config::CommonConfig;
use crate::error::ExecError;
use crate::hooks::FuncContext;
use crate::http::HttpCall;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Boxed async function operation.
pub type OpFunc =
    Arc<dyn Fn(FuncContext) -> BoxFuture<'static, Result<Value, ExecError>> + Send + Sync>;

/// Exactly one of the two forms.
#[derive(Clone)]
pub enum OperationKind {
    Request(HttpCall),
    Func(OpFunc),
}

/// One leaf operation plus its per-leaf configuration overrides.
#[derive(Clone)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    /// Names the group whose common config applies, if any.
    pub group: Option<String>,
    pub config: CommonConfig,
}

impl Operation {
    pub fn request(id: impl Into<String>, call: HttpCall) -> Self {
        Self {
            id: id.into(),
            kind: OperationKind::Request(call),
            group: None,
            config: CommonConfig::default(),
        }
    }

    /// A function operation from any async closure.
    pub fn func<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(FuncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            kind: OperationKind::Func(Arc::new(move |ctx| Box::pin(f(ctx)))),
            group: None,
            config: CommonConfig::default(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_config(mut self, config: CommonConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, OperationKind::Request(_))
    }

    pub fn call(&self) -> Option<&HttpCall> {
        match &self.kind {
            OperationKind::Request(call) => Some(call),
            OperationKind::Func(_) => None,
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            OperationKind::Request(call) => format!("{} {}", call.method.as_str(), call.path),
            OperationKind::Func(_) => "<func>".to_string(),
        };
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("group", &self.group)
            .finish()
    }
}
