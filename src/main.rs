use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use comfy_table::Table;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use pgr_pathman::catalog::HostCatalog;
use pgr_pathman::core::{DatabaseId, PathmanError, Result};
use pgr_pathman::pruning::{parse_data_type, parse_value};
use pgr_pathman::{
    parse_predicate, Column, InMemoryCatalog, IsolationLevel, Pathman, PathmanSettings, RelationId, Row,
    ScanPlan, Transaction,
};

/// pgr_pathman interactive shell
#[derive(Parser, Debug)]
#[command(name = "pgr_pathman")]
#[command(about = "Partitioning shell over an in-memory host catalog", long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory of the configuration store
    #[arg(short = 'D', long)]
    data_dir: Option<PathBuf>,

    /// Database id the shell works in
    #[arg(short = 'd', long, default_value_t = 1)]
    database: DatabaseId,

    /// Create partitions inline instead of in background workers
    #[arg(long)]
    no_workers: bool,
}

const HELP: &str = "\
Commands:
  table <name> <column> <type>[, <column> <type> ...]   create a table
  range <table> <column> <start> <interval> <count>     range partitioning
  hash <table> <column> <count>                         hash partitioning
  append <table> | prepend <table>                      add one range partition
  drop <partition>                                      drop a range partition
  partitions <table>                                    list partitions
  prune <table> <where clause>                          show partitions to scan
  insert <table> <value>[, <value> ...]                 route and store a row
  set <table> auto|bgw|parent on|off                    per-relation switches
  enable | disable                                      toggle partitioning
  help | quit";

struct Shell {
    pathman: Pathman,
    catalog: Arc<InMemoryCatalog>,
    database: DatabaseId,
}

/// Splits on whitespace, keeping quoted strings together (quotes included)
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn usage(text: &str) -> PathmanError {
    PathmanError::InvalidRequest(format!("usage: {text}"))
}

impl Shell {
    fn relid(&self, name: &str) -> Result<RelationId> {
        self.catalog
            .find_by_name(self.database, name)
            .ok_or_else(|| PathmanError::InvalidRequest(format!("relation \"{name}\" does not exist")))
    }

    fn name_of(&self, relid: RelationId) -> String {
        self.catalog
            .relation(relid)
            .ok()
            .flatten()
            .map_or_else(|| relid.to_string(), |m| m.name)
    }

    /// Runs `f` in its own READ COMMITTED transaction
    fn in_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self.pathman.begin(self.database, IsolationLevel::ReadCommitted);
        match f(&tx) {
            Ok(v) => {
                self.pathman.commit(&tx);
                Ok(v)
            }
            Err(e) => {
                self.pathman.rollback(&tx);
                Err(e)
            }
        }
    }

    fn execute(&self, line: &str) -> Result<()> {
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let args = split_args(rest);

        match command.to_lowercase().as_str() {
            "help" | "\\?" => println!("{HELP}"),
            "table" => self.create_table(rest)?,
            "range" => {
                let [table, column, start, interval, count] = args.as_slice() else {
                    return Err(usage("range <table> <column> <start> <interval> <count>"));
                };
                let relid = self.relid(table)?;
                let start = parse_value(start)?;
                let count = count.parse().map_err(|_| usage("count must be a number"))?;
                let interval = interval.trim_matches('\'');
                let created = self.in_transaction(|tx| {
                    self.pathman.create_range_partitions(tx, relid, column, &start, interval, count)
                })?;
                println!("{} partitions created", created.len());
            }
            "hash" => {
                let [table, column, count] = args.as_slice() else {
                    return Err(usage("hash <table> <column> <count>"));
                };
                let relid = self.relid(table)?;
                let count = count.parse().map_err(|_| usage("count must be a number"))?;
                let created =
                    self.in_transaction(|tx| self.pathman.create_hash_partitions(tx, relid, column, count))?;
                println!("{} partitions created", created.len());
            }
            "append" | "prepend" => {
                let [table] = args.as_slice() else {
                    return Err(usage("append|prepend <table>"));
                };
                let relid = self.relid(table)?;
                let partition = self.in_transaction(|tx| {
                    if command.eq_ignore_ascii_case("append") {
                        self.pathman.append_range_partition(tx, relid)
                    } else {
                        self.pathman.prepend_range_partition(tx, relid)
                    }
                })?;
                println!("created {}", self.name_of(partition));
            }
            "drop" => {
                let [partition] = args.as_slice() else {
                    return Err(usage("drop <partition>"));
                };
                let relid = self.relid(partition)?;
                self.in_transaction(|tx| self.pathman.drop_range_partition(tx, relid))?;
                println!("dropped {partition}");
            }
            "partitions" => {
                let [table] = args.as_slice() else {
                    return Err(usage("partitions <table>"));
                };
                let relid = self.relid(table)?;
                let mut out = Table::new();
                out.set_header(vec!["partition", "oid", "bound"]);
                for row in self.pathman.partition_list(self.database, relid)? {
                    out.add_row(vec![row.name, row.partition.to_string(), row.bound.to_string()]);
                }
                println!("{out}");
            }
            "prune" => {
                let (table, clause) = rest.split_once(char::is_whitespace).ok_or_else(|| usage("prune <table> <where clause>"))?;
                self.prune(table, clause)?;
            }
            "insert" => {
                let (table, values) = rest.split_once(char::is_whitespace).ok_or_else(|| usage("insert <table> <value>[, ...]"))?;
                self.insert(table, values)?;
            }
            "set" => {
                let [table, param, switch] = args.as_slice() else {
                    return Err(usage("set <table> auto|bgw|parent on|off"));
                };
                let relid = self.relid(table)?;
                let on = match switch.to_lowercase().as_str() {
                    "on" | "true" => true,
                    "off" | "false" => false,
                    _ => return Err(usage("set <table> auto|bgw|parent on|off")),
                };
                match param.to_lowercase().as_str() {
                    "auto" => self.pathman.set_auto(self.database, relid, on)?,
                    "bgw" => self.pathman.set_spawn_using_bgw(self.database, relid, on)?,
                    "parent" => self.pathman.set_enable_parent(self.database, relid, on)?,
                    _ => return Err(usage("set <table> auto|bgw|parent on|off")),
                }
                println!("{param} = {on} for {table}");
            }
            "enable" => {
                self.pathman.enable();
                println!("partitioning enabled");
            }
            "disable" => {
                self.pathman.disable();
                println!("partitioning disabled");
            }
            other => return Err(PathmanError::InvalidRequest(format!("unknown command '{other}', try 'help'"))),
        }
        Ok(())
    }

    fn create_table(&self, definition: &str) -> Result<()> {
        let (name, columns) = definition
            .split_once(char::is_whitespace)
            .ok_or_else(|| usage("table <name> <column> <type>[, ...]"))?;
        let columns = columns
            .split(',')
            .map(|def| {
                let (column, data_type) = def
                    .trim()
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| usage("column definitions are '<column> <type>'"))?;
                Ok(Column::new(column, parse_data_type(data_type.trim())?, true))
            })
            .collect::<Result<Vec<_>>>()?;
        let relid = self.catalog.create_table(self.database, name, columns)?;
        println!("created table {name} ({relid})");
        Ok(())
    }

    fn prune(&self, table: &str, clause: &str) -> Result<()> {
        let relid = self.relid(table)?;
        let expr = parse_predicate(clause)?;
        let plan = self.pathman.prune(self.database, relid, &expr)?;

        let mut out = Table::new();
        out.set_header(vec!["relation", "recheck"]);
        match &plan {
            ScanPlan::NotReady | ScanPlan::NotPartitioned => {
                out.add_row(vec![table.to_string(), "yes".to_string()]);
            }
            ScanPlan::Partitioned { result, parent_included } => {
                if *parent_included {
                    out.add_row(vec![table.to_string(), "yes".to_string()]);
                }
                for p in &result.partitions {
                    out.add_row(vec![self.name_of(p.partition), if p.recheck { "yes" } else { "no" }.to_string()]);
                }
            }
        }
        println!("{out}");
        match plan {
            ScanPlan::NotReady => println!("partitioning is not ready, scanning {table} as a plain table"),
            ScanPlan::NotPartitioned => println!("{table} is not partitioned"),
            ScanPlan::Partitioned { result, .. } => {
                println!("exact: {}, selectivity: {:.4}", result.exact, result.selectivity);
            }
        }
        Ok(())
    }

    fn insert(&self, table: &str, values: &str) -> Result<()> {
        let relid = self.relid(table)?;
        let values = values
            .split(',')
            .map(|v| parse_value(v.trim()))
            .collect::<Result<Vec<_>>>()?;
        let row = Row::new(values);

        let target = self.in_transaction(|tx| {
            let target = self.pathman.route_insert(tx, relid, &row)?;
            self.catalog.insert_row(target, row.clone())?;
            Ok(target)
        })?;
        println!("INSERT 0 1 -> {}", self.name_of(target));
        Ok(())
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = PathmanSettings::load(args.config.as_deref())?;
    // CLI args override everything
    if args.data_dir.is_some() {
        settings.data_dir = args.data_dir;
    }
    if args.no_workers {
        settings.spawn_using_bgw = false;
    }

    let catalog = Arc::new(InMemoryCatalog::new());
    let store = Pathman::open_store(&settings)?;
    let pathman = Pathman::new(settings, store, catalog.clone())?;
    let shell = Shell {
        pathman,
        catalog,
        database: args.database,
    };

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".pgr_pathman_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    println!("pgr_pathman shell, type 'help' for commands.\n");
    loop {
        match rl.readline("pathman> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                if matches!(line, "quit" | "exit" | "\\q") {
                    break;
                }
                if let Err(e) = shell.execute(line) {
                    eprintln!("ERROR: {e}");
                }
            }
            Err(ReadlineError::Interrupted) => println!("^C"),
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {e}");
                break;
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }
    Ok(())
}
