//! Command registry: name lookup, arity validation and fault isolation.
//!
//! Handlers are plain closures over a context type `C`. The registry turns
//! every outcome (unknown name, wrong arity, handler error, handler panic)
//! into a [`Response`] so a single bad request can never take a worker down.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use stockd_core::{InventoryError, Response, ReturnCode};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// CommandError
// ---------------------------------------------------------------------------

/// Failure of a single command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no such command: {name}")]
    NoSuchCommand { name: String },
    #[error("invalid arguments, usage: {usage}")]
    InvalidArguments { usage: String },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("{0}")]
    General(String),
}

impl CommandError {
    /// Shorthand for a general error.
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    #[must_use]
    pub fn code(&self) -> ReturnCode {
        match self {
            Self::NoSuchCommand { .. } => ReturnCode::NoSuchCommand,
            Self::InvalidArguments { .. } => ReturnCode::InvalidArguments,
            Self::Inventory(_) | Self::General(_) => ReturnCode::GeneralError,
        }
    }

    /// Builds the wire response for this error.
    #[must_use]
    pub fn into_response(self) -> Response {
        let code = self.code();
        let data = match self {
            Self::NoSuchCommand { name } => Value::String(name),
            Self::InvalidArguments { usage } => Value::String(usage),
            Self::Inventory(InventoryError::InsufficientStock { available }) => {
                json!({ "error": "insufficient stock", "available": available })
            }
            other => Value::String(other.to_string()),
        };
        Response::new(code, data)
    }
}

pub type CommandResult = Result<Value, CommandError>;

type Handler<C> = Box<dyn Fn(&C, &[&str]) -> CommandResult + Send + Sync>;

// ---------------------------------------------------------------------------
// CommandDescriptor
// ---------------------------------------------------------------------------

/// A registered command.
pub struct CommandDescriptor<C> {
    name: String,
    arity: usize,
    help: String,
    handler: Handler<C>,
}

impl<C> CommandDescriptor<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments after the command name.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Usage text returned on an arity mismatch.
    #[must_use]
    pub fn help(&self) -> &str {
        &self.help
    }
}

// ---------------------------------------------------------------------------
// CommandRegistry
// ---------------------------------------------------------------------------

/// Name-to-handler table, safe for concurrent lookup from every worker.
pub struct CommandRegistry<C> {
    commands: RwLock<HashMap<String, Arc<CommandDescriptor<C>>>>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> CommandRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// Returns `false` and keeps the existing handler if `name` is taken.
    pub fn register<F>(&self, name: &str, arity: usize, help: &str, handler: F) -> bool
    where
        F: Fn(&C, &[&str]) -> CommandResult + Send + Sync + 'static,
    {
        let mut commands = self.commands.write();
        if commands.contains_key(name) {
            warn!(command = name, "command already registered");
            return false;
        }
        commands.insert(
            name.to_string(),
            Arc::new(CommandDescriptor {
                name: name.to_string(),
                arity,
                help: help.to_string(),
                handler: Box::new(handler),
            }),
        );
        debug!(command = name, arity, "command registered");
        true
    }

    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<Arc<CommandDescriptor<C>>> {
        self.commands.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }

    /// Runs the command named by `tokens[0]` with the remaining tokens as
    /// arguments. Never panics; every failure becomes an error response.
    pub fn invoke(&self, ctx: &C, tokens: &[&str]) -> Response {
        let Some((&name, args)) = tokens.split_first() else {
            return CommandError::general("empty command").into_response();
        };

        let Some(descriptor) = self.descriptor(name) else {
            return CommandError::NoSuchCommand {
                name: name.to_string(),
            }
            .into_response();
        };

        if args.len() != descriptor.arity {
            return CommandError::InvalidArguments {
                usage: descriptor.help.clone(),
            }
            .into_response();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (descriptor.handler)(ctx, args)));
        match outcome {
            Ok(Ok(data)) => Response::success(data),
            Ok(Err(e)) => {
                debug!(command = name, error = %e, "command failed");
                e.into_response()
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(command = name, panic = %message, "command handler panicked");
                CommandError::General(message).into_response()
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command handler panicked".to_string()
    }
}

/// Parses a non-negative integer argument.
///
/// # Errors
///
/// Returns a general error naming the argument when `raw` is not an
/// unsigned integer.
pub fn parse_quantity(arg: &str, raw: &str) -> Result<u64, CommandError> {
    raw.parse::<u64>()
        .map_err(|_| CommandError::general(format!("invalid {arg}: {raw}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        greeting: &'static str,
    }

    fn registry() -> CommandRegistry<Ctx> {
        let registry = CommandRegistry::new();
        registry.register("echo", 1, "echo <word>", |ctx: &Ctx, args: &[&str]| {
            Ok(json!(format!("{} {}", ctx.greeting, args[0])))
        });
        registry.register("boom", 0, "boom", |_: &Ctx, _: &[&str]| -> CommandResult {
            panic!("exploded")
        });
        registry.register("fail", 0, "fail", |_: &Ctx, _: &[&str]| {
            Err(CommandError::Inventory(InventoryError::InsufficientStock {
                available: 7,
            }))
        });
        registry
    }

    const CTX: Ctx = Ctx { greeting: "hi" };

    #[test]
    fn success_wraps_handler_value() {
        let response = registry().invoke(&CTX, &["echo", "bob"]);
        assert_eq!(response, Response::success(json!("hi bob")));
    }

    #[test]
    fn unknown_command_returns_100_with_name() {
        let response = registry().invoke(&CTX, &["nope", "x"]);
        assert_eq!(response.code, 100);
        assert_eq!(response.data, json!("nope"));
    }

    #[test]
    fn arity_mismatch_returns_200_with_help() {
        let registry = registry();
        for tokens in [&["echo"][..], &["echo", "a", "b"][..]] {
            let response = registry.invoke(&CTX, tokens);
            assert_eq!(response.code, 200);
            assert_eq!(response.data, json!("echo <word>"));
        }
    }

    #[test]
    fn panic_is_contained_as_300() {
        let registry = registry();
        let response = registry.invoke(&CTX, &["boom"]);
        assert_eq!(response.code, 300);
        assert_eq!(response.data, json!("exploded"));

        // The registry keeps serving after a panic.
        assert!(registry.invoke(&CTX, &["echo", "again"]).is_success());
    }

    /// Records the level of every event it sees.
    struct Levels(Arc<parking_lot::Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.lock().push(*event.metadata().level());
        }
    }

    #[test]
    fn handler_panic_is_logged_as_error() {
        use tracing_subscriber::layer::SubscriberExt as _;

        let levels = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Levels(Arc::clone(&levels)));
        let registry = registry();

        let response = tracing::subscriber::with_default(subscriber, || registry.invoke(&CTX, &["boom"]));

        assert_eq!(response.code, 300);
        assert!(levels.lock().contains(&tracing::Level::ERROR));
    }

    #[test]
    fn insufficient_stock_carries_available() {
        let response = registry().invoke(&CTX, &["fail"]);
        assert_eq!(response.code, 300);
        assert_eq!(
            response.data,
            json!({"error": "insufficient stock", "available": 7})
        );
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let registry = registry();
        assert!(!registry.register("echo", 0, "other", |_: &Ctx, _: &[&str]| Ok(json!(1))));
        assert_eq!(registry.descriptor("echo").unwrap().arity(), 1);
        assert_eq!(registry.names(), vec!["boom", "echo", "fail"]);
    }

    #[test]
    fn empty_token_list_is_a_general_error() {
        assert_eq!(registry().invoke(&CTX, &[]).code, 300);
    }

    #[test]
    fn parse_quantity_names_the_argument() {
        assert_eq!(parse_quantity("qty", "12").unwrap(), 12);
        let err = parse_quantity("qty", "-1").unwrap_err();
        assert_eq!(err.to_string(), "invalid qty: -1");
        assert!(parse_quantity("stock", "abc").is_err());
    }
}
