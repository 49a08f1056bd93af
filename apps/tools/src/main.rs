use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use pipeline_core::{ordering::renormalized_keys, Board};
use shared::{domain::DealDetails, protocol::NewDeal};
use storage::Storage;
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/pipeline.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert the default stages into an empty database.
    SeedStages,
    /// Append a stage after the last one, or at `--display-order`.
    CreateStage {
        name: String,
        #[arg(long)]
        display_order: Option<i32>,
    },
    CreateDeal {
        #[arg(long)]
        office_name: String,
        #[arg(long)]
        stage: Option<String>,
        /// Days from now until the deal is due.
        #[arg(long, default_value_t = 30)]
        due_in_days: i64,
    },
    /// Print every active stage with its cards in board order.
    Board,
    /// Respace a stage's sort keys to 1000, 2000, ...
    Renormalize {
        #[arg(long)]
        stage: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let cli = Cli::parse();
    storage::ensure_sqlite_parent_dir_exists(&cli.database_url)?;
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::SeedStages => {
            let stages = storage.seed_default_stages().await?;
            for stage in stages {
                println!("{:>3}  {}  {}", stage.display_order, stage.id, stage.name);
            }
        }
        Command::CreateStage {
            name,
            display_order,
        } => {
            let display_order = match display_order {
                Some(order) => order,
                None => {
                    storage
                        .list_stages()
                        .await?
                        .iter()
                        .map(|stage| stage.display_order)
                        .max()
                        .unwrap_or(0)
                        + 1
                }
            };
            let stage = storage.create_stage(&name, display_order).await?;
            println!(
                "created stage_id={} display_order={}",
                stage.id, stage.display_order
            );
        }
        Command::CreateDeal {
            office_name,
            stage,
            due_in_days,
        } => {
            let stage_id = match stage {
                Some(name) => Some(
                    storage
                        .stage_by_name(&name)
                        .await?
                        .ok_or_else(|| anyhow!("no stage named {name}"))?
                        .id,
                ),
                None => None,
            };
            let deal = storage
                .insert_deal(NewDeal {
                    stage_id,
                    sort_order: None,
                    details: DealDetails::for_office(
                        &office_name,
                        Utc::now() + Duration::days(due_in_days),
                    ),
                })
                .await?;
            println!(
                "created deal_id={} stage_id={} sort_order={}",
                deal.id, deal.stage_id, deal.sort_order
            );
        }
        Command::Board => {
            let board = Board::mount(Arc::new(storage)).await?;
            for column in board.columns().await {
                println!("{} ({})", column.stage.name, column.cards.len());
                for card in column.cards {
                    println!(
                        "  {:>12.4}  {}  {}",
                        card.sort_order, card.id, card.details.title
                    );
                }
            }
            board.unmount();
        }
        Command::Renormalize { stage } => {
            let stage = storage
                .stage_by_name(&stage)
                .await?
                .ok_or_else(|| anyhow!("no stage named {stage}"))?;
            let cards: Vec<_> = storage
                .list_deals()
                .await?
                .into_iter()
                .filter(|deal| deal.stage_id == stage.id)
                .collect();
            let keys: Vec<_> = cards
                .iter()
                .zip(renormalized_keys(cards.len()))
                .map(|(card, key)| (card.id, key))
                .collect();
            storage.rewrite_sort_orders(&keys).await?;
            info!(stage = %stage.name, cards = keys.len(), "stage renormalized");
            println!("renormalized {} cards in {}", keys.len(), stage.name);
        }
    }

    Ok(())
}
