use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use amlogic_emmc_installer::config::{self, InstallerConfig};
use amlogic_emmc_installer::layout::{self, LayoutInput, RootFsType};
use amlogic_emmc_installer::registry::{BoardRecord, CUSTOM_BOARD_ID, FamilyFilter, Registry};
use amlogic_emmc_installer::release::ReleaseValues;
use amlogic_emmc_installer::resolver::{self, LiveInventory, ResolveOptions};
use amlogic_emmc_installer::session::{
    BoardSelection, InstallContext, InstallOptions, InstallSession,
};
use amlogic_emmc_installer::storage::{self, bootfs};
use amlogic_emmc_installer::{Error, ErrorKind, Result, executor, ui, workspace};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Installer config TOML (defaults to /etc/emmc-installer.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum YesNo {
    Yes,
    No,
}

impl From<YesNo> for bool {
    fn from(v: YesNo) -> bool {
        v == YesNo::Yes
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FsArg {
    Ext4,
    Btrfs,
}

impl From<FsArg> for RootFsType {
    fn from(v: FsArg) -> Self {
        match v {
            FsArg::Ext4 => RootFsType::Ext4,
            FsArg::Btrfs => RootFsType::Btrfs,
        }
    }
}

#[derive(Debug, clap::Args)]
struct InstallArgs {
    /// Prefer the board's mainline u-boot when it has one
    #[arg(short = 'm', long, value_enum, default_value_t = YesNo::No)]
    mainline_uboot: YesNo,
    /// Relayout the eMMC with ampart before partitioning
    #[arg(short = 'a', long, value_enum, default_value_t = YesNo::No)]
    ampart: YesNo,
    /// Offer every board instead of the running system's family
    #[arg(short = 'l', long, value_enum, default_value_t = YesNo::No)]
    show_all: YesNo,
    #[arg(long, value_enum, default_value_t = FsArg::Ext4)]
    rootfs: FsArg,
    /// Board id from the registry (0 = enter details manually)
    #[arg(long)]
    board: Option<u32>,
    #[arg(long)]
    soc: Option<String>,
    #[arg(long)]
    fdt: Option<String>,
    #[arg(long)]
    uboot_overload: Option<String>,
    #[arg(long)]
    mainline_uboot_file: Option<String>,
    #[arg(long)]
    bootloader_img: Option<String>,
    /// Log every command instead of touching the device
    #[arg(long)]
    dry_run: bool,
    /// Pick the board in a terminal UI
    #[arg(long)]
    tui: bool,
    /// Do not ask for confirmation
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the running system onto the internal eMMC
    Install(InstallArgs),
    /// List registry boards
    Boards {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        family: Option<String>,
    },
    /// Print the partition plan for a board
    Plan {
        #[arg(long)]
        board: u32,
        /// Assume ampart relaid the eMMC
        #[arg(long)]
        ampart: bool,
        #[arg(long, value_enum, default_value_t = FsArg::Ext4)]
        rootfs: FsArg,
    },
    /// Print the ordered install steps
    Steps {
        /// Print GraphViz dot instead of a linear list
        #[arg(long)]
        dot: bool,
        /// Include the ampart relayout step
        #[arg(long)]
        ampart: bool,
    },
}

fn init_logging(format: LogFormat) {
    dotenv::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let res = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    res.ok();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);
    let res = match args.cmd {
        Command::Install(install) => cmd_install(args.config, install),
        Command::Boards { all, family } => cmd_boards(args.config, all, family),
        Command::Plan {
            board,
            ampart,
            rootfs,
        } => cmd_plan(args.config, board, ampart, rootfs.into()),
        Command::Steps { dot, ampart } => cmd_steps(args.config, dot, ampart),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<InstallerConfig> {
    let doc = config::load_or_default(path.as_deref())?;
    let cfg = InstallerConfig::from_doc(&doc)?;
    workspace::validate_relative_paths(&cfg)?;
    Ok(cfg)
}

fn require_root() -> Result<()> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::new(
            ErrorKind::Precondition,
            "root privileges are required to install",
        ));
    }
    Ok(())
}

fn print_boards(boards: &[&BoardRecord]) {
    print!("{}", ui::board_table(boards));
}

fn cmd_boards(config: Option<PathBuf>, all: bool, family: Option<String>) -> Result<()> {
    let cfg = load_config(config)?;
    let registry = Registry::load(&cfg.paths.registry)?;
    let filter = match family {
        Some(f) => FamilyFilter::Family(f),
        None => {
            let release = ReleaseValues::load(&cfg.paths.release).ok();
            resolver::family_filter(release.as_ref(), all)?
        }
    };
    print_boards(&registry.list(&filter)?);
    Ok(())
}

fn cmd_plan(config: Option<PathBuf>, board: u32, ampart: bool, fs: RootFsType) -> Result<()> {
    let cfg = load_config(config)?;
    let registry = Registry::load(&cfg.paths.registry)?;
    let rec = registry.lookup(board)?;
    let plan = layout::plan(&LayoutInput::for_board(rec, ampart), fs);
    let (boot_start, boot_end) = plan.boot_range_mib();
    println!("board:   {} {} ({})", rec.id, rec.model, rec.soc);
    println!("rule:    {}", plan.rule);
    println!("boot:    {boot_start}MiB - {boot_end}MiB (fat32)");
    println!("root:    {}MiB - end ({})", plan.root_start_mib(), plan.filesystem_type);
    println!("options: {}", plan.root_mount_options);
    Ok(())
}

// Planning only consults the operator options, so the preview needs no device.
fn preview_session(cfg: InstallerConfig, ampart: bool) -> InstallSession {
    let context = InstallContext {
        target_device: "/dev/mmcblk2".into(),
        root_device_name: "sda".into(),
        rootfs_uuid: String::new(),
        filesystem_type: RootFsType::Ext4,
        need_bootloader_overload: false,
        external_repartition_used: false,
    };
    let board = BoardRecord {
        id: CUSTOM_BOARD_ID,
        ..Default::default()
    };
    InstallSession::new(
        cfg,
        context,
        BoardSelection::Manual(board),
        InstallOptions {
            mainline_uboot: false,
            ampart,
        },
    )
}

fn cmd_steps(config: Option<PathBuf>, dot: bool, ampart: bool) -> Result<()> {
    let cfg = load_config(config)?;
    let pipeline = storage::plan_install(&preview_session(cfg, ampart))?;
    if dot {
        print!("{}", pipeline.to_dot()?);
        return Ok(());
    }
    for (i, step) in pipeline.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<20} {:<11}  {}",
            i + 1,
            step.id,
            step.phase,
            step.label
        );
    }
    Ok(())
}

fn choose_board(
    args: &InstallArgs,
    registry: &Registry,
    filter: &FamilyFilter,
    running: Option<u32>,
) -> Result<BoardSelection> {
    let boards = registry.list(filter)?;
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    let id = match args.board {
        Some(id) => id,
        None if args.tui => ui::pick_board_tui(&boards, running)?,
        None => ui::prompt_board_id(&boards, running, &mut input, &mut output)?,
    };
    if id != CUSTOM_BOARD_ID {
        return Ok(BoardSelection::Lookup(registry.lookup_in(id, filter)?.clone()));
    }
    let fields = ui::ManualFields {
        soc: args.soc.clone(),
        device_tree_file: args.fdt.clone(),
        uboot_overload_file: args.uboot_overload.clone(),
        mainline_uboot_file: args.mainline_uboot_file.clone(),
        bootloader_img_file: args.bootloader_img.clone(),
    };
    Ok(BoardSelection::Manual(ui::manual_entry(
        fields,
        &mut input,
        &mut output,
    )?))
}

fn install_summary(session: &InstallSession) -> String {
    let board = session.board();
    format!(
        "target:  {}\nboard:   {} {} ({}, {})\nplan:    {}\nuuid:    {}",
        session.context.target_device.display(),
        board.id,
        board.model,
        board.soc,
        board.device_tree_file,
        session.plan,
        session.context.rootfs_uuid
    )
}

fn cmd_install(config: Option<PathBuf>, args: InstallArgs) -> Result<()> {
    require_root()?;
    let cfg = load_config(config)?;
    workspace::load_paths(&cfg.paths)?;

    let resolution = resolver::resolve(
        &LiveInventory,
        &ResolveOptions {
            release_file: cfg.paths.release.clone(),
            kernel_image: cfg.paths.kernel_image.clone(),
            filesystem_type: args.rootfs.into(),
            show_all: args.show_all.into(),
        },
    )?;

    let registry = Registry::load(&cfg.paths.registry)?;
    let running = resolution.release.as_ref().and_then(ReleaseValues::model_id);
    let mut selection = choose_board(&args, &registry, &resolution.filter, running)?;
    let live = bootfs::live_device_tree_file(&cfg.paths.boot_dir, &cfg.boot.configs);
    bootfs::prefer_live_device_tree(&mut selection, live.as_deref());

    let options = InstallOptions {
        mainline_uboot: args.mainline_uboot.into(),
        ampart: args.ampart.into(),
    };
    let mut session = InstallSession::new(cfg, resolution.context, selection, options);

    let summary = install_summary(&session);
    if args.yes || args.dry_run {
        println!("{summary}");
    } else {
        let stdin = io::stdin();
        if !ui::confirm(&summary, &mut stdin.lock(), &mut io::stdout())? {
            return Err(Error::new(ErrorKind::Precondition, "install cancelled"));
        }
    }
    io::stdout().flush().ok();

    let pipeline = storage::plan_install(&session)?;
    let reg = storage::builtin_registry()?;
    let sink = Arc::new(executor::StdoutSink::default());
    let mut ctx = executor::ExecCtx::new(args.dry_run, sink);
    executor::execute_pipeline(&mut session, &pipeline, &reg, &mut ctx)?;

    if args.dry_run {
        println!("dry run complete; nothing was written");
    } else {
        println!(
            "installed to {}; remove the external media and reboot",
            session.context.target_device.display()
        );
    }
    Ok(())
}
