#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};

use crate::catalog::{self, Catalog};
use crate::config;
use crate::engine::{TaskEngine, TaskEvent, TaskFailure, TaskHandle, TaskState};
use crate::error::MiniToolsError;
use crate::log::LogStream;
use crate::output::{self, Table};

#[derive(Debug, Parser)]
#[command(
    name = "minitools",
    version,
    about = "Linux maintenance task runner"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List built-in actions and discovered extension scripts
    List(ListArgs),
    /// Run a built-in action
    Run(RunArgs),
    /// Run an extension script from the extensions directory
    Ext(ExtArgs),
    /// Scan the extensions directory and report what was found
    Scan(ListArgs),
    /// Change the UUID of a partition
    Uuid(UuidArgs),
    /// Print system information blocks
    Info(InfoArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output in JSON format
    #[arg(long = "json")]
    pub json: bool,
    /// Output as CSV
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Action identifier (see `minitools list`)
    pub action: String,
    /// Template parameter, repeatable: --param key=value
    #[arg(short = 'p', long = "param")]
    pub params: Vec<String>,
    /// Prefix each output line with its capture timestamp
    #[arg(long = "timestamps")]
    pub timestamps: bool,
}

#[derive(Debug, Parser)]
pub struct ExtArgs {
    /// Script file name, e.g. cleanup.sh
    pub script: String,
    #[arg(long = "timestamps")]
    pub timestamps: bool,
}

#[derive(Debug, Parser)]
pub struct UuidArgs {
    /// Partition device, e.g. /dev/sda2
    pub device: String,
    /// Filesystem type (ext4, xfs, btrfs, swap). Probed with blkid when omitted.
    #[arg(short = 'f', long = "filesystem")]
    pub filesystem: Option<String>,
    /// New UUID; a random v4 UUID is generated when omitted
    #[arg(short = 'u', long = "uuid")]
    pub uuid: Option<String>,
    #[arg(long = "timestamps")]
    pub timestamps: bool,
}

#[derive(Debug, Parser)]
pub struct InfoArgs {
    /// Which block to print
    #[arg(value_parser = ["cpu", "memory", "swap", "disk", "kernel", "all"], default_value = "all")]
    pub block: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        None => {
            cmd_list(ListArgs {
                json: false,
                csv: false,
            })
            .await
        }
        Some(Commands::Completion(args)) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "minitools", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Config(args)) => match args.cmd {
            ConfigCmd::List => {
                print!("{}", config::list_resolved_toml()?);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Set(set) => {
                config::set_value_string(&set.key, &set.value)?;
                println!("Set {} = {}", set.key, set.value);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Get(get) => {
                let val = config::get_value_string(&get.key)?;
                match val {
                    Some(v) => {
                        println!("{v}");
                        Ok(ExitCode::SUCCESS)
                    }
                    None => anyhow::bail!(
                        "configuration key '{}' not found - use 'minitools config list' to see available keys",
                        get.key
                    ),
                }
            }
        },
        Some(Commands::List(args)) => cmd_list(args).await,
        Some(Commands::Run(args)) => cmd_run(args).await,
        Some(Commands::Ext(args)) => cmd_ext(args).await,
        Some(Commands::Scan(args)) => cmd_scan(args).await,
        Some(Commands::Uuid(args)) => cmd_uuid(args).await,
        Some(Commands::Info(args)) => cmd_info(&args),
        Some(Commands::Version) => Ok(cmd_version()),
    }
}

async fn load_engine() -> anyhow::Result<TaskEngine> {
    let (cfg, _paths) = tokio::task::spawn_blocking(config::load).await??;
    let extensions_dir = cfg.extensions_dir()?;
    let catalog = match cfg.distro_override() {
        Some(id) => Catalog::for_distro(Some(id)),
        None => Catalog::builtin(),
    };
    Ok(TaskEngine::new(catalog, extensions_dir, cfg.kill_grace()?))
}

async fn cmd_list(args: ListArgs) -> anyhow::Result<ExitCode> {
    let engine = load_engine().await?;
    let scan = engine.rescan()?;

    if args.json {
        #[derive(serde::Serialize)]
        struct Out<'a> {
            actions: &'a [catalog::Action],
            extensions: &'a crate::extensions::ScanReport,
        }
        let out = Out {
            actions: engine.catalog().actions(),
            extensions: &scan,
        };
        let mut s = serde_json::to_string_pretty(&out)?;
        s.push('\n');
        print!("{s}");
        return Ok(ExitCode::SUCCESS);
    }

    let mut actions = Table::new(["ID", "NAME", "COMMAND", "ELEVATED"]);
    for a in engine.catalog().actions() {
        actions.row([
            a.identifier.clone(),
            a.display_name.clone(),
            a.command.join(" "),
            if a.requires_elevation { "yes" } else { "no" }.to_owned(),
        ]);
    }
    if args.csv {
        actions.write_csv()?;
    } else {
        actions.print()?;
    }

    if scan.extensions.is_empty() {
        if !args.csv {
            println!(
                "\nNo extension scripts in {}",
                engine.extensions_dir().display()
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut exts = Table::new(["SCRIPT", "NAME", "INTERPRETER"]);
    for e in &scan.extensions {
        exts.row([
            e.identifier.clone(),
            e.display_name.clone(),
            e.kind.interpreter().to_owned(),
        ]);
    }
    if args.csv {
        exts.write_csv()?;
    } else {
        println!();
        exts.print()?;
    }

    for skipped in &scan.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_scan(args: ListArgs) -> anyhow::Result<ExitCode> {
    let engine = load_engine().await?;
    let scan = engine.rescan()?;

    if args.json {
        let mut s = serde_json::to_string_pretty(&scan)?;
        s.push('\n');
        print!("{s}");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} script(s) in {}",
        scan.extensions.len(),
        engine.extensions_dir().display()
    );
    if !scan.extensions.is_empty() {
        let mut t = Table::new(["SCRIPT", "NAME", "INTERPRETER", "PATH"]);
        for e in &scan.extensions {
            t.row([
                e.identifier.clone(),
                e.display_name.clone(),
                e.kind.interpreter().to_owned(),
                e.path.to_string_lossy().to_string(),
            ]);
        }
        if args.csv {
            t.write_csv()?;
        } else {
            t.print()?;
        }
    }
    for skipped in &scan.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let engine = load_engine().await?;

    let mut params = BTreeMap::new();
    for p in &args.params {
        let (key, value) = p
            .split_once('=')
            .with_context(|| format!("invalid --param '{p}': expected key=value"))?;
        params.insert(key.to_owned(), value.to_owned());
    }

    let handle = engine.start_action(&args.action, &params)?;
    stream_task(&engine, handle, args.timestamps).await
}

async fn cmd_ext(args: ExtArgs) -> anyhow::Result<ExitCode> {
    let engine = load_engine().await?;
    engine.rescan()?;

    let handle = engine.start_extension(&args.script)?;
    stream_task(&engine, handle, args.timestamps).await
}

async fn cmd_uuid(args: UuidArgs) -> anyhow::Result<ExitCode> {
    let engine = load_engine().await?;
    catalog::validate_block_device(&args.device)?;

    let filesystem = match args.filesystem {
        Some(fs) => fs,
        None => probe_filesystem(&args.device).await?,
    };
    let new_uuid = args
        .uuid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let params = catalog::uuid_change_params(&filesystem, &args.device, &new_uuid)?;
    println!("Changing UUID of {} ({filesystem}) to {new_uuid}", args.device);

    let handle = engine.start_action("uuid-change", &params)?;
    stream_task(&engine, handle, args.timestamps).await
}

/// Ask blkid for the partition's filesystem type. This is a read-only
/// probe, so it runs outside the engine's single execution slot.
async fn probe_filesystem(device: &str) -> anyhow::Result<String> {
    let argv = catalog::probe_filesystem_command(device);
    let out = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .await
        .with_context(|| format!("failed to run {}", argv.join(" ")))?;
    if !out.status.success() {
        anyhow::bail!("blkid could not determine the filesystem of {device}");
    }
    let fs = String::from_utf8_lossy(&out.stdout).trim().to_owned();
    if fs.is_empty() {
        anyhow::bail!("blkid reported no filesystem type for {device}");
    }
    Ok(fs)
}

/// Print task output as it arrives and map the terminal state to an exit
/// code. Ctrl+C requests cancellation; the engine confirms the process is
/// gone before the task finishes as cancelled.
async fn stream_task(
    engine: &TaskEngine,
    mut handle: TaskHandle,
    timestamps: bool,
) -> anyhow::Result<ExitCode> {
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                eprintln!("interrupt received, stopping task...");
                request_cancel(engine, handle.task_id)?;
                cancel_requested = true;
            }
            event = handle.events.recv() => {
                match event {
                    Some(TaskEvent::Line(line)) => {
                        let rendered = output::format_log_line(&line, timestamps);
                        if line.stream == LogStream::Stderr {
                            eprintln!("{rendered}");
                        } else {
                            println!("{rendered}");
                        }
                    }
                    Some(TaskEvent::Finished(snap)) => {
                        return Ok(match snap.state {
                            TaskState::Succeeded => ExitCode::SUCCESS,
                            TaskState::Cancelled => {
                                eprintln!("task cancelled");
                                ExitCode::from(130)
                            }
                            _ => {
                                match snap.exit_code {
                                    Some(code) => {
                                        eprintln!("task failed with exit code {code}");
                                        ExitCode::from(u8::try_from(code).unwrap_or(1))
                                    }
                                    None => {
                                        match &snap.failure {
                                            Some(TaskFailure::SpawnFailed { message })
                                            | Some(TaskFailure::Supervision { message }) => {
                                                eprintln!("{message}");
                                            }
                                            _ => eprintln!("task terminated without an exit code"),
                                        }
                                        ExitCode::from(1)
                                    }
                                }
                            }
                        });
                    }
                    None => {
                        return Err(MiniToolsError::Other(
                            "task ended without a terminal event".to_owned(),
                        )
                        .into());
                    }
                }
            }
        }
    }
}

/// The task may finish between the interrupt and this call; its terminal
/// event is still queued for the caller to drain, so a missing active task
/// is not an error here.
fn request_cancel(engine: &TaskEngine, task_id: u64) -> anyhow::Result<()> {
    match engine.cancel(task_id) {
        Ok(()) | Err(MiniToolsError::NoActiveTask) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn cmd_info(args: &InfoArgs) -> anyhow::Result<ExitCode> {
    let blocks: Vec<(&str, Vec<String>)> = match args.block.as_str() {
        "cpu" => vec![("CPU", crate::sysinfo::cpu_info())],
        "memory" => vec![("Memory", crate::sysinfo::memory_info())],
        "swap" => vec![("Swap", crate::sysinfo::swap_info())],
        "disk" => vec![("Disk", crate::sysinfo::disk_info())],
        "kernel" => vec![("Kernel", crate::sysinfo::kernel_info())],
        _ => vec![
            ("CPU", crate::sysinfo::cpu_info()),
            ("Memory", crate::sysinfo::memory_info()),
            ("Swap", crate::sysinfo::swap_info()),
            ("Disk", crate::sysinfo::disk_info()),
            ("Kernel", crate::sysinfo::kernel_info()),
        ],
    };

    for (i, (title, lines)) in blocks.iter().enumerate() {
        if i > 0 {
            println!();
        }
        println!("{title}:");
        for line in lines {
            println!("  {line}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> ExitCode {
    println!("minitools version {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("MINITOOLS_GIT_COMMIT") {
        println!("  commit: {commit}");
    }
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_core_commands() {
        let cli = Cli::try_parse_from(["minitools", "run", "flatpak-update"]).unwrap();
        assert!(matches!(cli.cmd, Some(Commands::Run(_))));

        let cli = Cli::try_parse_from([
            "minitools", "uuid", "/dev/sda2", "-f", "ext4", "-u",
            "9f3c1f9a-3a43-4e2b-8e5a-0a1b2c3d4e5f",
        ])
        .unwrap();
        let Some(Commands::Uuid(args)) = cli.cmd else {
            panic!("expected uuid command");
        };
        assert_eq!(args.device, "/dev/sda2");
        assert_eq!(args.filesystem.as_deref(), Some("ext4"));

        let cli = Cli::try_parse_from(["minitools", "info", "disk"]).unwrap();
        let Some(Commands::Info(args)) = cli.cmd else {
            panic!("expected info command");
        };
        assert_eq!(args.block, "disk");

        assert!(Cli::try_parse_from(["minitools", "info", "floppy"]).is_err());
    }

    #[tokio::test]
    async fn cancel_after_completion_is_not_an_error() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("quick.sh"), "echo done\n").expect("write");

        let engine = TaskEngine::new(
            Catalog::for_distro(Some("debian")),
            td.path().to_path_buf(),
            std::time::Duration::from_secs(2),
        );
        engine.rescan().expect("rescan");

        let mut handle = engine.start_extension("quick.sh").expect("start");
        while let Some(event) = handle.events.recv().await {
            if matches!(event, TaskEvent::Finished(_)) {
                break;
            }
        }

        // An interrupt that loses the race against completion must not turn
        // a successful run into a failure.
        request_cancel(&engine, handle.task_id).expect("benign");
    }

    #[test]
    fn run_params_use_key_value_form() {
        let cli =
            Cli::try_parse_from(["minitools", "run", "uuid-change", "-p", "device=/dev/sda1"])
                .unwrap();
        let Some(Commands::Run(args)) = cli.cmd else {
            panic!("expected run command");
        };
        assert_eq!(args.params, vec!["device=/dev/sda1".to_owned()]);
    }
}
