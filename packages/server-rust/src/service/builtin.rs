//! Built-in command set.
//!
//! Inventory commands take quantities as unsigned integers; anything else is
//! a general error naming the argument. `reservation.*` commands take the
//! client id before the SKU.

use serde_json::json;

use super::command::{parse_quantity, CommandError, CommandRegistry, CommandResult};
use super::persistence::PERSISTENCE_DISABLED;
use crate::context::ServerContext;

/// Registers every built-in command. Returns how many were added.
pub fn register_builtin(commands: &CommandRegistry<ServerContext>) -> usize {
    let table: [(&str, usize, &str, fn(&ServerContext, &[&str]) -> CommandResult); 12] = [
        ("product.add", 2, "product.add <sku> <stock>", product_add),
        ("product.info", 1, "product.info <sku>", product_info),
        ("stock.set", 2, "stock.set <sku> <qty>", stock_set),
        ("stock.dec", 2, "stock.dec <sku> <qty>", stock_dec),
        ("stock.get", 1, "stock.get <sku>", stock_get),
        ("reservation.add", 3, "reservation.add <clientId> <sku> <qty>", reservation_add),
        ("reservation.del", 3, "reservation.del <clientId> <sku> <qty>", reservation_del),
        ("reservation.set", 3, "reservation.set <clientId> <sku> <qty>", reservation_set),
        ("core.workers", 0, "core.workers", core_workers),
        ("core.shutdown", 0, "core.shutdown", core_shutdown),
        ("config.reload", 0, "config.reload", config_reload),
        ("db.save", 0, "db.save", db_save),
    ];

    let mut added = 0;
    for (name, arity, help, handler) in table {
        if commands.register(name, arity, help, handler) {
            added += 1;
        }
    }
    added
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

fn product_add(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let stock = parse_quantity("stock", args[1])?;
    ctx.store.add_product(args[0], stock)?;
    Ok(json!("ok"))
}

fn product_info(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    Ok(json!(ctx.store.info(args[0])?))
}

fn stock_set(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let qty = parse_quantity("qty", args[1])?;
    ctx.store.set_stock(args[0], qty)?;
    Ok(json!("ok"))
}

fn stock_dec(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let qty = parse_quantity("qty", args[1])?;
    let stock = ctx.store.dec_stock(args[0], qty)?;
    Ok(json!({ "stock": stock }))
}

fn stock_get(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let stock = ctx.store.get_stock(args[0])?;
    Ok(json!({ "stock": stock }))
}

fn reservation_add(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let qty = parse_quantity("qty", args[2])?;
    ctx.store.reservation_add(args[1], args[0], qty)?;
    Ok(json!("ok"))
}

fn reservation_del(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let qty = parse_quantity("qty", args[2])?;
    ctx.store.reservation_del(args[1], args[0], qty)?;
    Ok(json!("ok"))
}

fn reservation_set(ctx: &ServerContext, args: &[&str]) -> CommandResult {
    let qty = parse_quantity("qty", args[2])?;
    ctx.store.reservation_set(args[1], args[0], qty)?;
    Ok(json!("ok"))
}

// ---------------------------------------------------------------------------
// Server control
// ---------------------------------------------------------------------------

fn core_workers(ctx: &ServerContext, _args: &[&str]) -> CommandResult {
    let stats = ctx.pool.stats(ctx.tunables().max_workers);
    Ok(json!({ "active": stats.active, "idle": stats.idle, "max": stats.max }))
}

fn core_shutdown(ctx: &ServerContext, _args: &[&str]) -> CommandResult {
    ctx.shutdown.trigger_shutdown();
    Ok(json!("ok"))
}

fn config_reload(ctx: &ServerContext, _args: &[&str]) -> CommandResult {
    ctx.reload()
        .map_err(|e| CommandError::general(format!("{e:#}")))?;
    Ok(json!("ok"))
}

fn db_save(ctx: &ServerContext, _args: &[&str]) -> CommandResult {
    if !ctx.persistence.is_enabled() {
        return Err(CommandError::general(PERSISTENCE_DISABLED));
    }
    let path = ctx
        .save_snapshot()
        .map_err(|e| CommandError::general(format!("{e:#}")))?;
    Ok(json!({ "file": path.display().to_string() }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use stockd_core::{InventoryStore, Response};

    use super::*;
    use crate::config::ConfigSource;
    use crate::network::ServerState;
    use crate::service::config::{DatabaseConfig, Tunables};

    fn context_with(tunables: Tunables) -> ServerContext {
        let store = Arc::new(InventoryStore::new());
        let ctx = ServerContext::new(Arc::clone(&store), tunables, ConfigSource::defaults());
        assert_eq!(register_builtin(&ctx.commands), 12);
        ctx.hooks.register(store);
        ctx
    }

    fn context() -> ServerContext {
        context_with(Tunables::default())
    }

    fn run(ctx: &ServerContext, line: &str) -> Response {
        let tokens = stockd_core::tokenize(line);
        ctx.commands.invoke(ctx, &tokens)
    }

    fn ok(ctx: &ServerContext, line: &str) -> Value {
        let response = run(ctx, line);
        assert!(response.is_success(), "{line} -> {response:?}");
        response.data
    }

    #[test]
    fn registering_twice_adds_nothing() {
        let ctx = context();
        assert_eq!(register_builtin(&ctx.commands), 0);
        assert_eq!(ctx.commands.len(), 12);
    }

    #[test]
    fn reservation_admission_scenario() {
        let ctx = context();
        assert_eq!(ok(&ctx, "product.add X 100"), json!("ok"));
        assert_eq!(ok(&ctx, "reservation.add c1 X 30"), json!("ok"));

        let rejected = run(&ctx, "reservation.add c2 X 80");
        assert_eq!(rejected.code, 300);
        assert_eq!(
            rejected.data,
            json!({"error": "insufficient stock", "available": 100})
        );

        assert_eq!(
            ok(&ctx, "product.info X"),
            json!({"stock": 100, "totalReserved": 30})
        );
    }

    #[test]
    fn stock_commands() {
        let ctx = context();
        ok(&ctx, "product.add A 10");
        assert_eq!(ok(&ctx, "stock.dec A 3"), json!({"stock": 7}));
        assert_eq!(ok(&ctx, "stock.dec A 50"), json!({"stock": 0}));
        assert_eq!(ok(&ctx, "stock.set A 42"), json!("ok"));
        assert_eq!(ok(&ctx, "stock.get A"), json!({"stock": 42}));
    }

    #[test]
    fn reservation_set_and_del() {
        let ctx = context();
        ok(&ctx, "product.add A 10");
        ok(&ctx, "reservation.set c1 A 6");
        assert_eq!(ok(&ctx, "product.info A")["totalReserved"], 6);

        assert_eq!(run(&ctx, "reservation.set c1 A 11").code, 300);
        ok(&ctx, "reservation.del c1 A 4");
        assert_eq!(ok(&ctx, "product.info A")["totalReserved"], 2);

        ok(&ctx, "reservation.del c9 A 4");
    }

    #[test]
    fn errors_map_to_codes() {
        let ctx = context();
        ok(&ctx, "product.add A 1");

        let duplicate = run(&ctx, "product.add A 1");
        assert_eq!(duplicate.code, 300);
        assert_eq!(duplicate.data, json!("sku already exists: A"));

        let missing = run(&ctx, "stock.get Z");
        assert_eq!((missing.code, missing.data), (300, json!("unknown sku: Z")));

        let unknown = run(&ctx, "stock.explode A");
        assert_eq!((unknown.code, unknown.data), (100, json!("stock.explode")));

        let arity = run(&ctx, "reservation.add A 1");
        assert_eq!(
            (arity.code, arity.data),
            (200, json!("reservation.add <clientId> <sku> <qty>"))
        );

        let bad_qty = run(&ctx, "stock.set A lots");
        assert_eq!((bad_qty.code, bad_qty.data), (300, json!("invalid qty: lots")));
    }

    #[test]
    fn core_workers_reports_pool_gauge() {
        let ctx = context_with(Tunables {
            max_workers: 7,
            ..Tunables::default()
        });
        ctx.pool.publish(3, 1);
        assert_eq!(
            ok(&ctx, "core.workers"),
            json!({"active": 3, "idle": 1, "max": 7})
        );
    }

    #[test]
    fn core_shutdown_triggers_controller() {
        let ctx = context();
        ok(&ctx, "core.shutdown");
        assert!(ctx.shutdown.is_triggered());
        assert_eq!(ctx.shutdown.state(), ServerState::Stopping);
    }

    #[test]
    fn config_reload_with_defaults_succeeds() {
        let ctx = context();
        assert_eq!(ok(&ctx, "config.reload"), json!("ok"));
    }

    #[test]
    fn db_save_requires_persistence() {
        let ctx = context();
        let response = run(&ctx, "db.save");
        assert_eq!((response.code, response.data), (300, json!(PERSISTENCE_DISABLED)));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("db.json");
        let ctx = context_with(Tunables {
            database: DatabaseConfig {
                persistence: true,
                file: file.clone(),
                autosave_interval: std::time::Duration::ZERO,
            },
            ..Tunables::default()
        });
        ok(&ctx, "product.add A 5");
        assert_eq!(
            ok(&ctx, "db.save"),
            json!({"file": file.display().to_string()})
        );
        assert!(file.exists());
    }
}
