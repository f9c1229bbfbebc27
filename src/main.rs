#![forbid(unsafe_code)]

use ambrosia::{
    config::{self, Settings},
    database::Database,
    event::{Publisher, Receipt},
    history::{History, Settlement},
    ledger::rpc::RpcAdapter,
    options::{Command, Options},
    order::{Order, Status, StatusSummary},
    swap::{Coordinator, FatalInconsistency, NewOrder},
    trace, verify, Amount, Timestamp,
};
use anyhow::Context;
use futures::StreamExt;
use std::sync::Arc;
use structopt::StructOpt;

const EXIT_SUCCESS: i32 = 0;
const EXIT_TRANSIENT: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_FATAL: i32 = 3;

#[tokio::main]
async fn main() {
    let options = Options::from_args();

    let settings = match config::read_config(&options.config_file)
        .map_err(|e| e.to_string())
        .and_then(|file| {
            Settings::from_config_file_and_defaults(file).map_err(|e| e.to_string())
        }) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Could not initialize configuration: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = trace::init_tracing(settings.logging.level) {
        eprintln!("Could not initialize tracing: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    let code = match run(options.cmd, settings).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);

            if e.downcast_ref::<FatalInconsistency>().is_some() {
                EXIT_FATAL
            } else {
                EXIT_TRANSIENT
            }
        }
    };

    std::process::exit(code);
}

async fn run(cmd: Command, settings: Settings) -> anyhow::Result<i32> {
    let db = Arc::new(
        Database::new(&settings.data.dir.join("database")).context("could not open database")?,
    );

    let alpha = Arc::new(RpcAdapter::new(
        &settings.ledger_a.name,
        settings.ledger_a.node_url.clone(),
        settings.ledger_a.confirmations,
    ));
    let beta = Arc::new(RpcAdapter::new(
        &settings.ledger_b.name,
        settings.ledger_b.node_url.clone(),
        settings.ledger_b.confirmations,
    ));

    let publisher = Arc::new(Publisher::new());
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&db),
        Arc::clone(&alpha),
        Arc::clone(&beta),
        Arc::clone(&publisher),
        settings.execution_params(),
    ));

    match cmd {
        Command::Start {
            token_a,
            token_b,
            amount_a,
            amount_b,
            counterparty_b,
        } => {
            let collected = db
                .collect_garbage(settings.swap.order_retention_ms, wall_clock_now())
                .await
                .context("garbage collection failed")?;
            if collected > 0 {
                tracing::info!("garbage collected {} retired orders", collected);
            }

            respawn_orders(&db, &coordinator)?;

            let order = coordinator
                .create_order(NewOrder {
                    token_a,
                    token_b,
                    amount_a: Amount::from_base_units(amount_a),
                    amount_b: Amount::from_base_units(amount_b),
                    counterparty_b: ambrosia::ledger::Address::new(counterparty_b),
                })
                .await?;

            let mut events = publisher.subscribe(order.order_id);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::error!("could not serialize progress event: {}", e),
                    }
                }
            });

            let finished = coordinator.drive(&order.order_id).await?;

            settle(&settings, &finished)?;

            let receipt = Receipt::from_order(&finished, wall_clock_now());
            println!(
                "{}",
                serde_json::to_string_pretty(&receipt).context("could not serialize receipt")?
            );

            Ok(exit_code_for(&finished))
        }
        Command::Status { order_id } => {
            let order = db
                .get_order(&order_id)?
                .with_context(|| format!("order {} does not exist", order_id))?;

            println!(
                "{}",
                serde_json::to_string_pretty(&StatusSummary::from(&order))?
            );

            Ok(EXIT_SUCCESS)
        }
        Command::Verify { order_id } => {
            let report = verify::verify_order(&db, alpha, beta, &order_id).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.all_ok() {
                Ok(EXIT_SUCCESS)
            } else {
                Ok(EXIT_FATAL)
            }
        }
        Command::Refund { order_id } => {
            let finished = coordinator.force_refund(&order_id).await?;

            settle(&settings, &finished)?;

            let receipt = Receipt::from_order(&finished, wall_clock_now());
            println!("{}", serde_json::to_string_pretty(&receipt)?);

            Ok(exit_code_for(&finished))
        }
        Command::Cancel { order_id } => {
            let cancelled = coordinator.cancel(&order_id).await?;

            println!("cancelled order {}", cancelled.order_id);

            Ok(EXIT_SUCCESS)
        }
        Command::Balance => {
            use ambrosia::ledger::Adapter;

            let address_a = alpha.address().await.map_err(anyhow::Error::new)?;
            let balance_a = alpha.balance().await.map_err(anyhow::Error::new)?;
            let address_b = beta.address().await.map_err(anyhow::Error::new)?;
            let balance_b = beta.balance().await.map_err(anyhow::Error::new)?;

            println!(
                "{}: {} ({})",
                settings.ledger_a.name, balance_a, address_a
            );
            println!(
                "{}: {} ({})",
                settings.ledger_b.name, balance_b, address_b
            );

            Ok(EXIT_SUCCESS)
        }
    }
}

/// Resume every order the last run left unfinished. Each one gets its
/// own task; recovery is the regular drive path.
fn respawn_orders(
    db: &Arc<Database>,
    coordinator: &Arc<Coordinator<RpcAdapter, RpcAdapter>>,
) -> anyhow::Result<()> {
    for order in db.non_terminal_orders()? {
        let order_id = order.order_id;
        tracing::info!(order_id = %order_id, status = %order.status, "resuming order");

        let coordinator = Arc::clone(coordinator);
        tokio::spawn(async move {
            if let Err(e) = coordinator.drive(&order_id).await {
                tracing::error!(order_id = %order_id, "resumed order stopped: {:#}", e);
            }
        });
    }

    Ok(())
}

fn settle(settings: &Settings, order: &Order) -> anyhow::Result<()> {
    let mut history = History::new(&settings.data.dir.join("history.csv"))?;
    history.write(Settlement::new(order, wall_clock_now()))?;

    Ok(())
}

fn exit_code_for(order: &Order) -> i32 {
    match order.status {
        Status::Completed | Status::Refunded => EXIT_SUCCESS,
        Status::Failed => {
            if order.failure_reason.as_deref() == Some("fatal-inconsistency") {
                EXIT_FATAL
            } else {
                EXIT_TRANSIENT
            }
        }
        _ => EXIT_TRANSIENT,
    }
}

fn wall_clock_now() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};

    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    #[allow(clippy::cast_possible_truncation)]
    Timestamp::from_millis(elapsed.as_millis() as u64)
}
