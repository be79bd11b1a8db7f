//! xnu-introspect command-line entry point

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{warn, LevelFilter};

use xnu_introspect::kern::ThreadList;
use xnu_introspect::report::{self, ThreadRow};
use xnu_introspect::{GdbRemote, KAddr, Layout, MemoryReader, Session, SnapshotMemory, SymbolTable};

#[derive(Parser)]
#[command(name = "xnu-introspect")]
#[command(about = "Inspect XNU threads, tasks, IPC and zones through a debugger connection", long_about = None)]
struct Cli {
    /// GDB remote stub to read from (host:port)
    #[arg(long, conflicts_with = "snapshot", required_unless_present = "snapshot")]
    remote: Option<String>,

    /// Offline memory snapshot (JSON)
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Kernel build whose built-in layout to use
    #[arg(long, default_value = "16B92")]
    build: String,

    /// Layout file (TOML) replacing the built-in layout
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Directory holding the SymbolsNew and KnownLables tables
    #[arg(long)]
    symbols: Option<PathBuf>,

    /// Remote register number for a register name, e.g. TPIDR_EL1=65
    #[arg(long = "register", value_name = "NAME=NUM", value_parser = parse_register)]
    registers: Vec<(String, u32)>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List threads: all, `user`, `current` (current task) or those of a task
    Threads { scope: Option<String> },
    /// List tasks
    Tasks,
    /// Show one thread
    ThreadInfo { thread: KAddr },
    /// Show one task
    TaskInfo { task: KAddr },
    /// Show one voucher
    VoucherInfo { voucher: KAddr },
    /// Show one IPC port
    IpcPortInfo { port: KAddr },
    /// List the live entries of an IPC space
    IpcEntries {
        /// Task whose space to list
        #[arg(long, conflicts_with = "space", required_unless_present = "space")]
        task: Option<KAddr>,
        /// Space to list
        #[arg(long)]
        space: Option<KAddr>,
    },
    /// List valid allocator zones
    Zones,
}

fn parse_register(arg: &str) -> std::result::Result<(String, u32), String> {
    let (name, num) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=NUM, got {:?}", arg))?;
    let num = num
        .trim()
        .parse::<KAddr>()
        .map_err(|e| e.to_string())
        .and_then(|n| u32::try_from(n.raw()).map_err(|e| e.to_string()))?;
    Ok((name.trim().to_string(), num))
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn open_reader(cli: &Cli) -> Result<Box<dyn MemoryReader>> {
    if let Some(path) = &cli.snapshot {
        let mem = SnapshotMemory::load(path)
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        return Ok(Box::new(mem));
    }
    let remote = cli.remote.as_deref().ok_or_else(|| anyhow!("no target given"))?;
    let mut client =
        GdbRemote::connect(remote).with_context(|| format!("connecting to {}", remote))?;
    for (name, num) in &cli.registers {
        client = client.with_register(name, *num);
    }
    Ok(Box::new(client))
}

fn open_layout(cli: &Cli) -> Result<Layout> {
    match &cli.layout {
        Some(path) => Layout::load(path).with_context(|| format!("loading layout {}", path.display())),
        None => Ok(Layout::for_build(&cli.build)?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let layout = open_layout(&cli)?;
    let symbols = match &cli.symbols {
        Some(dir) => SymbolTable::load_dir(dir)
            .with_context(|| format!("loading symbols from {}", dir.display()))?,
        None => SymbolTable::empty(),
    };
    let reader = open_reader(&cli)?;
    let session = Session::attach(reader, layout).context("attaching to target")?;

    match session.is_in_kernel_space() {
        Ok(true) => {}
        Ok(false) => {
            println!("\nYou are currently in user space, this functionality is not available here.\n");
            return Ok(());
        }
        Err(e) => warn!("cannot tell the exception level, continuing: {}", e),
    }

    run(&session, &symbols, &cli.command)
}

fn run<M: MemoryReader>(session: &Session<M>, symbols: &SymbolTable, command: &Command) -> Result<()> {
    match command {
        Command::Threads { scope } => {
            let (list, user_only) = match scope.as_deref() {
                None => (ThreadList::Global, false),
                Some("user") => (ThreadList::Global, true),
                Some("current") => (ThreadList::Task(session.current_task()?), false),
                Some(task) => {
                    let task: KAddr = task.parse().map_err(|e| anyhow!("bad task {:?}: {}", task, e))?;
                    warn_if_unlisted_task(session, task)?;
                    (ThreadList::Task(task), false)
                }
            };
            let current = session.current().address();
            let mut rows = Vec::new();
            for thread in session.threads(list)? {
                let thread = thread?;
                if !user_only || thread.is_user() {
                    rows.push(ThreadRow::build(session, symbols, &thread, current));
                }
            }
            print!("{}", report::thread_table(&rows));
        }
        Command::Tasks => {
            for task in session.tasks()? {
                println!("{}", report::task_row(session, &task?));
            }
        }
        Command::ThreadInfo { thread } => {
            if !session.thread_exists(*thread)? {
                println!("Given thread does not exist");
                return Ok(());
            }
            let thread = session
                .thread(*thread)
                .ok_or_else(|| anyhow!("thread address is NULL"))?;
            println!("{}", report::thread_info(session, symbols, &thread));
        }
        Command::TaskInfo { task } => {
            warn_if_unlisted_task(session, *task)?;
            let task = session.task(*task).ok_or_else(|| anyhow!("task address is NULL"))?;
            println!("{}", report::task_info(session, &task));
        }
        Command::VoucherInfo { voucher } => {
            let voucher = session
                .voucher(*voucher)
                .ok_or_else(|| anyhow!("voucher address is NULL"))?;
            println!("{}", report::voucher_info(&voucher));
        }
        Command::IpcPortInfo { port } => {
            let port = session.ipc_port(*port).ok_or_else(|| anyhow!("port address is NULL"))?;
            println!("{}", report::port_info(&port));
        }
        Command::IpcEntries { task, space } => {
            let space_addr = match (task, space) {
                (Some(task), _) => {
                    warn_if_unlisted_task(session, *task)?;
                    let task = session.task(*task).ok_or_else(|| anyhow!("task address is NULL"))?;
                    task.ipc_space.require("task ipc space")?
                }
                (None, Some(space)) => *space,
                (None, None) => bail!("give --task or --space"),
            };
            let space = session
                .ipc_space(space_addr)
                .ok_or_else(|| anyhow!("ipc space address is NULL"))?;
            println!("=================================================");
            print!("{}", report::space_info(&space));
            println!("=================================================\n");
            for entry in session.ipc_entries(&space)? {
                match entry {
                    Ok(entry) => println!("{}", report::entry_row(&entry)),
                    Err(e) => warn!("{}", e),
                }
            }
        }
        Command::Zones => {
            let zones = session.zones()?;
            println!("Printing zones info:");
            println!("zone_arr_addr: {:#018x}", session.layout().globals.zone_array.raw());
            println!("max_zones: {}", zones.count_hint());
            for zone in zones {
                match zone {
                    Ok(zone) => print!("{}", report::zone_info(&zone)),
                    Err(e) => warn!("{}", e),
                }
            }
        }
    }
    Ok(())
}

fn warn_if_unlisted_task<M: MemoryReader>(session: &Session<M>, task: KAddr) -> Result<()> {
    if !session.task_exists(task)? {
        println!("\nRequested task {} does not exist in the task list of the system!\n", task);
    }
    Ok(())
}
