use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use olyos_engine::{
    api::{BacktestRequest, ErrorResponse, OptimizeRequestBody, RebalanceRequest, UniverseInput},
    commands::{self, backtest, export_market_data, history, optimize, rebalance},
    context::AppContext,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";
const DEFAULT_HISTORY_FILE: &str = "data/backtest_history.json";

#[derive(Parser)]
#[command(name = "olyos-engine")]
#[command(about = "Quality-value portfolio backtester, optimizer and rebalancer")]
struct Cli {
    /// Path to the market data snapshot file
    #[arg(long = "data-file", value_name = "PATH", global = true)]
    data_file: Option<PathBuf>,
    /// Path to the backtest history file
    #[arg(long = "history-file", value_name = "PATH", global = true)]
    history_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backtest of the quality-value rule
    Backtest {
        /// JSON request body; flags below override its fields
        #[arg(long, value_name = "PATH")]
        request: Option<PathBuf>,
        #[arg(long)]
        start_date: Option<chrono::NaiveDate>,
        #[arg(long)]
        end_date: Option<chrono::NaiveDate>,
        /// Country, `europe` or `all`
        #[arg(long)]
        scope: Option<String>,
        /// Comma separated tickers; overrides the scope
        #[arg(long)]
        universe: Option<String>,
        #[arg(long)]
        pe_max: Option<f64>,
        #[arg(long)]
        roe_min: Option<f64>,
        #[arg(long)]
        pe_sell: Option<f64>,
        #[arg(long)]
        roe_min_hold: Option<f64>,
        #[arg(long)]
        debt_equity_max: Option<f64>,
        /// monthly, quarterly, semi-annual or yearly
        #[arg(long)]
        rebalance_freq: Option<String>,
        #[arg(long)]
        initial_capital: Option<f64>,
        #[arg(long)]
        max_positions: Option<usize>,
        #[arg(long)]
        benchmark: Option<String>,
        /// Skip saving the result to the history
        #[arg(long)]
        no_save: bool,
        /// History name (defaults to scope and thresholds)
        #[arg(long)]
        name: Option<String>,
    },
    /// Grid-search the screening thresholds for a goal
    Optimize {
        /// JSON request body
        #[arg(long, value_name = "PATH")]
        request: Option<PathBuf>,
        #[arg(long)]
        scope: Option<String>,
        /// growth, income, defensive, sharpe or balanced
        #[arg(long)]
        goal: Option<String>,
        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// Compare a live portfolio with its target weights
    Rebalance {
        #[arg(value_enum)]
        mode: RebalanceModeArg,
        /// JSON file with `portfolio` and optional `method`
        #[arg(long, value_name = "PATH")]
        portfolio: PathBuf,
        /// equal, score or conviction
        #[arg(long)]
        method: Option<String>,
    },
    /// Manage saved backtests
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Convert a JSON market data export into the binary snapshot
    ExportMarketData {
        /// Source JSON snapshot
        #[arg(short, long = "input", value_name = "PATH")]
        input: PathBuf,
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RebalanceModeArg {
    Analyze,
    Propose,
    Simulate,
}

impl From<RebalanceModeArg> for rebalance::RebalanceMode {
    fn from(mode: RebalanceModeArg) -> Self {
        match mode {
            RebalanceModeArg::Analyze => rebalance::RebalanceMode::Analyze,
            RebalanceModeArg::Propose => rebalance::RebalanceMode::Propose,
            RebalanceModeArg::Simulate => rebalance::RebalanceMode::Simulate,
        }
    }
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Rename { id: String, name: String },
    Delete { id: String },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = print_json(&ErrorResponse::new(format!("{:#}", err)));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        data_file,
        history_file,
        command,
    } = cli;
    let market_data_path = data_file.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
    let history_path = history_file.unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_FILE));

    info!("Starting engine. Not financial advice. Past performance does not predict future returns.");

    match command {
        Commands::Backtest {
            request,
            start_date,
            end_date,
            scope,
            universe,
            pe_max,
            roe_min,
            pe_sell,
            roe_min_hold,
            debt_equity_max,
            rebalance_freq,
            initial_capital,
            max_positions,
            benchmark,
            no_save,
            name,
        } => {
            let base: BacktestRequest = match request {
                Some(path) => commands::read_json(&path)?,
                None => BacktestRequest::default(),
            };
            let request = BacktestRequest {
                start_date: start_date.or(base.start_date),
                end_date: end_date.or(base.end_date),
                universe_scope: scope.or(base.universe_scope),
                universe: universe.map(UniverseInput::Csv).or(base.universe),
                pe_max: pe_max.or(base.pe_max),
                roe_min: roe_min.or(base.roe_min),
                pe_sell: pe_sell.or(base.pe_sell),
                roe_min_hold: roe_min_hold.or(base.roe_min_hold),
                debt_equity_max: debt_equity_max.or(base.debt_equity_max),
                rebalance_freq: rebalance_freq.or(base.rebalance_freq),
                initial_capital: initial_capital.or(base.initial_capital),
                max_positions: max_positions.or(base.max_positions),
                benchmark: benchmark.or(base.benchmark),
                fee_rate: base.fee_rate,
            };
            let app = AppContext::new(market_data_path, history_path);
            let save = if no_save {
                None
            } else {
                Some(name.unwrap_or_default())
            };
            let response = backtest::run(&app, request, save.as_deref())?;
            print_json(&response)?;
        }
        Commands::Optimize {
            request,
            scope,
            goal,
            quiet,
        } => {
            let base: OptimizeRequestBody = match request {
                Some(path) => commands::read_json(&path)?,
                None => OptimizeRequestBody::default(),
            };
            let body = OptimizeRequestBody {
                scope: scope.or(base.scope),
                goal: goal.or(base.goal),
                ..base
            };
            let app = AppContext::new(market_data_path, history_path);
            let outcome = optimize::run(&app, body, !quiet)?;
            print_json(&outcome)?;
        }
        Commands::Rebalance {
            mode,
            portfolio,
            method,
        } => {
            let mut request: RebalanceRequest = commands::read_json(&portfolio)?;
            if method.is_some() {
                request.method = method;
            }
            let app = AppContext::new(market_data_path, history_path);
            let value = rebalance::run(&app, mode.into(), &request)?;
            print_json(&value)?;
        }
        Commands::History { action } => {
            let app = AppContext::new(market_data_path, history_path);
            match action {
                HistoryAction::List => print_json(&history::list(&app)?)?,
                HistoryAction::Rename { id, name } => {
                    history::rename(&app, &id, &name)?;
                    print_json(&serde_json::json!({ "success": true }))?;
                }
                HistoryAction::Delete { id } => {
                    history::delete(&app, &id)?;
                    print_json(&serde_json::json!({ "success": true }))?;
                }
            }
        }
        Commands::ExportMarketData { input, output } => {
            let output_path = output.unwrap_or(market_data_path);
            if input == output_path {
                return Err(anyhow!("Input and output snapshot paths must differ"));
            }
            export_market_data::run(&input, &output_path)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
