//! Operations CLI for a sheetbase spreadsheet.
//!
//! ```bash
//! # Create missing sheets and header rows
//! sheetbase-admin init
//!
//! # Compare every live header with its schema
//! sheetbase-admin validate
//!
//! # Filter, sort and page a table
//! sheetbase-admin query tasks --filter status:eq:todo --sort due_date --limit 20
//!
//! # Totals per status
//! sheetbase-admin aggregate invoices total --group-by status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sheetbase::sheets::{Filter, FilterOperator, Query, SortDirection};
use sheetbase::{SheetStore, StoreConfig};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "sheetbase-admin", version, about = "Provision, check and inspect a sheetbase spreadsheet")]
struct Args {
    /// Configuration file path
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Spreadsheet id, overriding the config file
    #[arg(long, global = true)]
    spreadsheet: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create missing sheets and header rows
    Init,
    /// Check every sheet's header against its schema
    Validate,
    /// Print the records of a table as JSON
    Query {
        table: String,
        /// Filter as column:operator:value (repeatable; `in` takes a comma list)
        #[arg(long = "filter", value_name = "COL:OP:VALUE")]
        filters: Vec<String>,
        /// Sort column, optionally suffixed with :desc
        #[arg(long, value_name = "COL[:desc]")]
        sort: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
    },
    /// Count/sum/avg/min/max of a numeric field
    Aggregate {
        table: String,
        field: String,
        #[arg(long, value_name = "FIELD")]
        group_by: Option<String>,
        #[arg(long = "filter", value_name = "COL:OP:VALUE")]
        filters: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    sheetbase::init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> CliResult<ExitCode> {
    let mut config = StoreConfig::resolve(args.config.as_deref())?;
    if let Some(id) = args.spreadsheet {
        config.spreadsheet_id = id;
    }
    config.validate()?;

    let store = SheetStore::from_config(&config)?;
    tracing::info!(spreadsheet = %config.spreadsheet_id, "connected");

    match args.command {
        Command::Init => {
            for (table, status) in store.initialize_sheets().await? {
                println!("{}: {}", table, serde_json::to_string(&status)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate => {
            let reports = store.validate_all_sheets().await;
            let mut all_valid = true;
            for report in &reports {
                if report.is_valid() {
                    println!("{}: ok", report.table);
                } else {
                    all_valid = false;
                    for message in report.messages() {
                        println!("{}: {}", report.table, message);
                    }
                }
            }
            let known = store.registry().names();
            for sheet in store.client().sheet_names().await? {
                if !known.contains(&sheet.as_str()) {
                    println!("{}: not managed by sheetbase", sheet);
                }
            }
            Ok(if all_valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Query {
            table,
            filters,
            sort,
            limit,
            offset,
        } => {
            let mut query = build_query(&filters)?;
            if let Some(sort) = sort {
                query = match sort.rsplit_once(':') {
                    Some((column, dir)) if dir.eq_ignore_ascii_case("desc") => {
                        query.sort_by(column, SortDirection::Desc)
                    }
                    Some((column, dir)) if dir.eq_ignore_ascii_case("asc") => {
                        query.sort_by(column, SortDirection::Asc)
                    }
                    _ => query.sort_by(sort.as_str(), SortDirection::Asc),
                };
            }
            query.limit = limit;
            query.offset = offset;

            let records = store.query(&table, &query).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Aggregate {
            table,
            field,
            group_by,
            filters,
        } => {
            let query = build_query(&filters)?;
            let output = match group_by {
                Some(group) => serde_json::to_string_pretty(&store.aggregate_by(&table, &query, &group, &field).await?)?,
                None => serde_json::to_string_pretty(&store.aggregate(&table, &query, &field).await?)?,
            };
            println!("{}", output);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_query(filters: &[String]) -> CliResult<Query> {
    filters
        .iter()
        .try_fold(Query::new(), |query, raw| Ok(query.filter(parse_filter(raw)?)))
}

fn parse_filter(raw: &str) -> CliResult<Filter> {
    let mut parts = raw.splitn(3, ':');
    let (Some(column), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("filter '{}' is not column:operator:value", raw).into());
    };
    let operator = FilterOperator::parse(op).ok_or_else(|| format!("unknown filter operator '{}'", op))?;

    Ok(match operator {
        FilterOperator::In => Filter::one_of(column, value.split(',').map(str::trim)),
        _ => Filter::new(column, operator, value),
    })
}
