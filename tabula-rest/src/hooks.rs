//! Custom actions and before/after interceptors
//!
//! Interceptors are keyed by action name or [`WILDCARD_ACTION`]. For a given
//! action the specific interceptors run first, then the wildcard ones, each
//! group in registration order.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tabula_auth::Identity;
use tabula_common::error::{Error, Result};
use tabula_common::request::{ApiRequest, ApiResponse};

/// Interceptor key matching every action
pub const WILDCARD_ACTION: &str = "*";

/// Actions served by the pipeline itself; custom handlers cannot shadow them
pub const BUILTIN_ACTIONS: &[&str] = &[
    "tables",
    "columns",
    "list",
    "count",
    "read",
    "create",
    "update",
    "delete",
    "bulk_create",
    "bulk_delete",
    "openapi",
    "login",
];

/// What a hook sees of the request being processed
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub action: &'a str,
    pub request: &'a ApiRequest,
    pub identity: Option<&'a Identity>,
}

/// Handler serving a custom action
pub type ActionHandler = Arc<dyn Fn(&HookContext<'_>) -> Result<ApiResponse> + Send + Sync>;

/// Runs before dispatch; an `Err` aborts the request
pub type BeforeHook = Arc<dyn Fn(&HookContext<'_>) -> Result<()> + Send + Sync>;

/// Runs after dispatch and may rewrite the response
pub type AfterHook = Arc<dyn Fn(&HookContext<'_>, &mut ApiResponse) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    actions: RwLock<HashMap<String, ActionHandler>>,
    before: RwLock<HashMap<String, Vec<BeforeHook>>>,
    after: RwLock<HashMap<String, Vec<AfterHook>>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a custom action
    ///
    /// # Errors
    /// Returns `Error::Config` if `name` is a built-in action or the wildcard.
    pub fn register_action<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&HookContext<'_>) -> Result<ApiResponse> + Send + Sync + 'static,
    {
        if name == WILDCARD_ACTION || BUILTIN_ACTIONS.contains(&name) {
            return Err(Error::Config(format!(
                "action '{name}' is reserved and cannot be registered"
            )));
        }
        self.actions.write().insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Handler for a custom action
    #[must_use]
    pub fn action(&self, name: &str) -> Option<ActionHandler> {
        self.actions.read().get(name).cloned()
    }

    #[must_use]
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    pub fn before<F>(&self, action: &str, hook: F)
    where
        F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.before
            .write()
            .entry(action.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    pub fn after<F>(&self, action: &str, hook: F)
    where
        F: Fn(&HookContext<'_>, &mut ApiResponse) -> Result<()> + Send + Sync + 'static,
    {
        self.after
            .write()
            .entry(action.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Run the before interceptors for `ctx.action`, stopping at the first error
    ///
    /// # Errors
    /// Returns the first error raised by an interceptor, or `Error::Hook` when
    /// one panics.
    pub fn run_before(&self, ctx: &HookContext<'_>) -> Result<()> {
        let hooks = ordered(&self.before.read(), ctx.action);
        for hook in hooks {
            contain("before", ctx.action, || hook(ctx))?;
        }
        Ok(())
    }

    /// Run the after interceptors for `ctx.action` over `response`
    ///
    /// # Errors
    /// Returns the first error raised by an interceptor, or `Error::Hook` when
    /// one panics.
    pub fn run_after(&self, ctx: &HookContext<'_>, response: &mut ApiResponse) -> Result<()> {
        let hooks = ordered(&self.after.read(), ctx.action);
        for hook in hooks {
            contain("after", ctx.action, || hook(ctx, &mut *response))?;
        }
        Ok(())
    }
}

/// Run one interceptor, turning a panic into `Error::Hook`
fn contain(stage: &str, action: &str, hook: impl FnOnce() -> Result<()>) -> Result<()> {
    catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|payload| {
        Err(Error::Hook(format!(
            "{stage} hook for '{action}' panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// Specific hooks then wildcard hooks, cloned out so no lock is held while
/// they run
fn ordered<H: Clone>(hooks: &HashMap<String, Vec<H>>, action: &str) -> Vec<H> {
    let specific = hooks.get(action).into_iter().flatten();
    let wildcard = if action == WILDCARD_ACTION {
        None
    } else {
        hooks.get(WILDCARD_ACTION)
    };
    specific.chain(wildcard.into_iter().flatten()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use tabula_common::request::Method;

    fn request() -> ApiRequest {
        ApiRequest::new(Method::Get).with_query("action", "list")
    }

    #[test]
    fn test_specific_before_wildcard_in_registration_order() {
        let registry = HookRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (key, tag) in [("*", "w1"), ("list", "s1"), ("*", "w2"), ("list", "s2"), ("read", "r")] {
            let calls = Arc::clone(&calls);
            registry.before(key, move |_| {
                calls.lock().push(tag);
                Ok(())
            });
        }

        let req = request();
        let ctx = HookContext {
            action: "list",
            request: &req,
            identity: None,
        };
        registry.run_before(&ctx).unwrap();
        assert_eq!(*calls.lock(), vec!["s1", "s2", "w1", "w2"]);
    }

    #[test]
    fn test_before_hook_aborts() {
        let registry = HookRegistry::new();
        let reached = Arc::new(Mutex::new(false));
        registry.before("list", |_| Err(Error::Forbidden("maintenance".into())));
        let flag = Arc::clone(&reached);
        registry.before("*", move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let req = request();
        let ctx = HookContext {
            action: "list",
            request: &req,
            identity: None,
        };
        assert!(matches!(registry.run_before(&ctx), Err(Error::Forbidden(_))));
        assert!(!*reached.lock());
    }

    #[test]
    fn test_after_hook_rewrites_body() {
        let registry = HookRegistry::new();
        registry.after("read", |ctx, response| {
            response.body["served_by"] = json!(ctx.action);
            Ok(())
        });

        let req = request();
        let ctx = HookContext {
            action: "read",
            request: &req,
            identity: None,
        };
        let mut response = ApiResponse::ok(json!({"id": 1}));
        registry.run_after(&ctx, &mut response).unwrap();
        assert_eq!(response.body["served_by"], "read");
    }

    #[test]
    fn test_custom_actions() {
        let registry = HookRegistry::new();
        registry
            .register_action("ping", |_| Ok(ApiResponse::ok(json!({"pong": true}))))
            .unwrap();
        assert!(registry.has_action("ping"));
        assert!(matches!(
            registry.register_action("list", |_| Ok(ApiResponse::ok(json!(null)))),
            Err(Error::Config(_))
        ));

        let req = request();
        let ctx = HookContext {
            action: "ping",
            request: &req,
            identity: None,
        };
        let handler = registry.action("ping").unwrap();
        assert_eq!(handler(&ctx).unwrap().body["pong"], true);
        assert!(registry.action("missing").is_none());
    }

    #[test]
    fn test_panicking_interceptor_reports_hook_error() {
        let registry = HookRegistry::new();
        registry.after("*", |_, _| panic!("audit sink offline"));

        let req = request();
        let ctx = HookContext {
            action: "list",
            request: &req,
            identity: None,
        };
        registry.run_before(&ctx).unwrap();

        let mut response = ApiResponse::ok(json!([]));
        let err = registry.run_after(&ctx, &mut response).unwrap_err();
        assert_eq!(err.status_code(), 500);
        match err {
            Error::Hook(msg) => {
                assert!(msg.contains("after hook for 'list'"));
                assert!(msg.contains("audit sink offline"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
