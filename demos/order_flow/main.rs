//! STX Example - Order Flow
//!
//! This example demonstrates context-scoped transactions:
//! - Binding a store into a context
//! - Closure-scoped transactions with automatic commit/rollback
//! - Deferred scopes that span several calls
//! - Events emitted only after a successful commit
//!
//! Run with: cargo run -p order_flow
//! Set `RUST_LOG=debug` to see transaction boundaries.

use parking_lot::Mutex;
use std::sync::Arc;
use stx_core::{
    attach, begin_deferred, current, on_success, run_in_transaction, with_deferred, Context,
    TxError, TxOptions, TxResult,
};
use stx_store::{IsolationLevel, MemoryStore, Store};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Events published after commits.
#[derive(Debug, Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    fn emit(&self, event: impl Into<String>) {
        let event = event.into();
        println!("[EVENT] {event}");
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

fn store_of(ctx: &Context) -> TxResult<stx_store::StoreRef> {
    current(ctx).ok_or(TxError::NoStoreBound)
}

/// Places an order and reserves stock in one transaction.
fn place_order(ctx: &Context, events: &EventLog, order: &str, qty: u32) -> TxResult<()> {
    run_in_transaction(ctx, |tx_ctx| {
        let store = store_of(tx_ctx)?;
        let stock = store
            .get("stock", "widget")?
            .map(|raw| u32::from_le_bytes(raw.try_into().unwrap_or([0; 4])))
            .unwrap_or(0);
        if stock < qty {
            return Err(TxError::aborted(format!(
                "order {order}: only {stock} widgets left"
            )));
        }

        store.put("stock", "widget", (stock - qty).to_le_bytes().to_vec())?;
        store.put("orders", order, qty.to_le_bytes().to_vec())?;

        let events = events.clone();
        let order = order.to_string();
        on_success(tx_ctx, move || events.emit(format!("order_placed {order}")));
        Ok(())
    })
}

/// Archives every order using a deferred scope spanning several calls.
fn archive_orders(ctx: &Context, events: &EventLog, orders: &[&str]) -> TxResult<()> {
    let (tx_ctx, cleanup) = begin_deferred(ctx, &TxOptions::default())?;
    let result = archive_each(&tx_ctx, orders);

    let events = events.clone();
    let count = orders.len();
    on_success(&tx_ctx, move || events.emit(format!("orders_archived {count}")));
    cleanup.finish(result)
}

fn archive_each(ctx: &Context, orders: &[&str]) -> TxResult<()> {
    let store = store_of(ctx)?;
    for order in orders {
        if let Some(qty) = store.get("orders", order)? {
            store.put("archive", order, qty)?;
            store.delete("orders", order)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = MemoryStore::new();
    let ctx = attach(&Context::background(), store.clone().into_ref());
    let events = EventLog::default();

    store_of(&ctx)?.put("stock", "widget", 5_u32.to_le_bytes().to_vec())?;

    println!("=== 1. Successful order ===");
    place_order(&ctx, &events, "A-1", 3)?;

    println!("\n=== 2. Rejected order (rolled back, no event) ===");
    if let Err(err) = place_order(&ctx, &events, "A-2", 4) {
        println!("Expected error: {err}");
    }

    println!("\n=== 3. Nested orders share one transaction ===");
    let nested: TxResult<()> = run_in_transaction(&ctx, |outer| {
        place_order(outer, &events, "B-1", 1)?;
        place_order(outer, &events, "B-2", 5)
    });
    if let Err(err) = nested {
        println!("Expected error: {err} (B-1 was rolled back too)");
    }

    println!("\n=== 4. Deferred archive ===");
    archive_orders(&ctx, &events, &["A-1", "B-1"])?;

    println!("\n=== 5. Panic converted to an error ===");
    let options = TxOptions::new().isolation(IsolationLevel::Serializable);
    let recovered: TxResult<()> = with_deferred(&ctx, &options, |tx_ctx| {
        store_of(tx_ctx)?.put("orders", "C-1", vec![1])?;
        panic!("payment gateway unreachable");
    });
    if let Err(err) = recovered {
        println!("Recovered: {err}");
    }

    println!("\n=== 6. Event outside a transaction fires immediately ===");
    let immediate = events.clone();
    on_success(&ctx, move || immediate.emit("heartbeat"));

    info!(
        archived = store.count("archive")?,
        open_orders = store.count("orders")?,
        stats = ?store.stats(),
        "done"
    );

    println!("\n=== Events ===");
    for (i, event) in events.events().iter().enumerate() {
        println!("{}. {}", i + 1, event);
    }
    Ok(())
}
