use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use hwpoint_core::arch::{aarch64, powerpc};
use hwpoint_core::capability::Interface;
use hwpoint_core::degrade::MaskTable;
use hwpoint_core::encode::{self, EncodeOptions};
use hwpoint_core::platform::sim::{Operation, SimulatedKernel};
use hwpoint_core::platform::BACKENDS;
use hwpoint_core::point::{EncodedPoint, PointKind, Span};
use hwpoint_core::types::{Address, Architecture, ThreadId};
use hwpoint_core::{HwPointManager, KernelError, ManagerConfig, Result as HwResult};
use hwpoint_utils::{debug, default_log_path, info, init_logging, LogFormat, LogLevel, LoggingConfig};

mod script;

use script::{parse_u64, KindArg, Step};

/// Inspect and replay hardware breakpoint/watchpoint slot allocation.
#[derive(Parser, Debug)]
#[command(name = "hwpoint")]
#[command(version)]
#[command(about = "Inspect and replay hardware breakpoint/watchpoint slot allocation", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true, value_parser = parse_level)]
    log_level: Option<LogLevel>,
    /// Log format: pretty, compact or json (overrides HWPOINT_LOG_FORMAT)
    #[arg(long, global = true, value_parser = parse_format)]
    log_format: Option<LogFormat>,
    /// Also write logs to this file (overrides HWPOINT_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Write logs to ~/.hwpoint/<date>-hwpoint.log
    #[arg(long, global = true, default_value_t = false, conflicts_with = "log_file")]
    log_to_file: bool,
    /// Dump slot tables after every change (needs trace level)
    #[arg(long, global = true, default_value_t = false)]
    show_debug_regs: bool,
    /// Start with restricted byte masks
    #[arg(long, global = true, default_value_t = false)]
    assume_restricted_masks: bool,
    /// Masks a restricted kernel accepts, e.g. 0x01,0x03,0x0f,0xff
    #[arg(long, global = true)]
    mask_table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Show compiled backends and the capabilities of each target preset
    Info,
    /// Show how a request is encoded into hardware entries
    Encode
    {
        /// Simulated target
        #[arg(short, long, value_enum, default_value_t = Target::Aarch64)]
        target: Target,
        /// Point kind
        #[arg(short, long, value_enum, default_value_t = KindArg::Write)]
        kind: KindArg,
        /// Start address (hex with 0x prefix, or decimal)
        #[arg(value_parser = parse_u64)]
        address: u64,
        /// Length in bytes (watchpoints default to 1; breakpoints use it as a range)
        #[arg(value_parser = parse_u64)]
        length: Option<u64>,
        /// Encode a masked watchpoint with this address mask instead
        #[arg(long, value_parser = parse_u64, conflicts_with = "length")]
        mask: Option<u64>,
    },
    /// Check whether a region can be watched with hardware registers
    Region
    {
        /// Simulated target
        #[arg(short, long, value_enum, default_value_t = Target::Aarch64)]
        target: Target,
        /// Start address
        #[arg(value_parser = parse_u64)]
        address: u64,
        /// Length in bytes
        #[arg(value_parser = parse_u64)]
        length: u64,
    },
    /// Replay a session against the simulated kernel
    ///
    /// Steps: insert:<kind>:<addr>[:<len>], remove:<kind>:<addr>[:<len>],
    /// thread:<tid>, exit:<tid>, resume[:<tid>], reject, vanish:<tid>
    Simulate
    {
        /// Simulated target
        #[arg(short, long, value_enum, default_value_t = Target::Aarch64)]
        target: Target,
        /// Thread group leader
        #[arg(long, default_value_t = 1000)]
        leader: i32,
        /// Keep going after a failed step
        #[arg(long, default_value_t = false)]
        keep_going: bool,
        /// Steps to replay, in order
        #[arg(required = true)]
        steps: Vec<Step>,
    },
}

/// Simulated kernel presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target
{
    /// AArch64, 6 breakpoints and 4 watchpoints
    Aarch64,
    /// AArch64 kernel before 4.10 (restricted byte masks)
    Aarch64Old,
    /// AArch32 compat tracee, 6 breakpoints and 4 watchpoints
    Arm,
    /// Embedded PowerPC (440 style)
    Booke,
    /// Server PowerPC with a DAWR
    Server,
    /// PowerPC with only the legacy DABR
    Legacy,
    /// Embedded PowerPC with only the legacy DABR
    LegacyBooke,
}

impl Target
{
    const ALL: [Target; 7] = [
        Target::Aarch64,
        Target::Aarch64Old,
        Target::Arm,
        Target::Booke,
        Target::Server,
        Target::Legacy,
        Target::LegacyBooke,
    ];

    fn kernel(self) -> SimulatedKernel
    {
        match self {
            Target::Aarch64 => SimulatedKernel::aarch64(6, 4),
            Target::Aarch64Old => SimulatedKernel::aarch64(6, 4).with_restricted_masks(MaskTable::default()),
            Target::Arm => SimulatedKernel::aarch64(6, 4).with_architecture(Architecture::AArch32),
            Target::Booke => SimulatedKernel::powerpc_booke(),
            Target::Server => SimulatedKernel::powerpc_server(),
            Target::Legacy => SimulatedKernel::powerpc_legacy(false),
            Target::LegacyBooke => SimulatedKernel::powerpc_legacy(true),
        }
    }
}

fn parse_level(s: &str) -> Result<LogLevel, String>
{
    s.parse().map_err(|err| format!("{err}"))
}

fn parse_format(s: &str) -> Result<LogFormat, String>
{
    s.parse().map_err(|err| format!("{err}"))
}

fn main()
{
    let cli = Cli::parse();

    let logging = match LoggingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read logging configuration: {}", e);
            process::exit(1);
        }
    };
    let log_file = if cli.log_to_file { Some(default_log_path()) } else { cli.log_file.clone() };
    let mut logging = logging.with_level(cli.log_level).with_file(log_file);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Environment configuration with the command-line flags layered on top.
fn manager_config(cli: &Cli) -> HwResult<ManagerConfig>
{
    let mut config = ManagerConfig::from_env()?;
    if cli.show_debug_regs {
        config = config.with_show_debug_regs(true);
    }
    if cli.assume_restricted_masks {
        config = config.with_assume_restricted_masks(true);
    }
    if let Some(table) = &cli.mask_table {
        config = config.with_mask_table(table.parse()?);
    }
    Ok(config)
}

fn run_command(cli: Cli) -> HwResult<()>
{
    let config = manager_config(&cli)?;
    debug!("Manager configuration: {:?}", config);

    match cli.command {
        Commands::Info => {
            println!("Backends: {}", BACKENDS);
            println!("Mask table: {}", config.mask_table);
            println!("\nTargets:");
            for target in Target::ALL {
                let mut manager = HwPointManager::new(target.kernel(), ThreadId(1), config.clone());
                println!("  {:<13} {}", format!("{target:?}").to_lowercase(), manager.capabilities());
            }
            Ok(())
        }
        Commands::Encode {
            target,
            kind,
            address,
            length,
            mask,
        } => {
            let mut manager = HwPointManager::new(target.kernel(), ThreadId(1), config);
            let caps = manager.capabilities().clone();
            let booke = caps.architecture.is_booke();
            let kind = PointKind::from(kind);

            let fragments = match mask {
                Some(mask) => vec![encode::encode_masked(kind, Address::new(address), mask, &caps)?],
                None => {
                    let request = script::request(kind, address, length);
                    let options = EncodeOptions {
                        restricted: manager.restriction(),
                        comparator: None,
                    };
                    encode::encode(&request, &caps, &options)?.into_vec()
                }
            };

            println!("{}", caps);
            println!("{} fragment(s):", fragments.len());
            for (i, point) in fragments.iter().enumerate() {
                println!("  [{i}] {point}");
                println!("      covers {}", point.watched);
                print_hardware_encoding(point, caps.interface, booke);
            }
            Ok(())
        }
        Commands::Region {
            target,
            address,
            length,
        } => {
            let mut manager = HwPointManager::new(target.kernel(), ThreadId(1), config);
            let address = Address::new(address);
            if manager.region_ok_for_watchpoint(address, length) {
                println!("{} + {} can be watched in hardware", address, length);
            } else {
                println!("{} + {} cannot be watched in hardware", address, length);
            }
            Ok(())
        }
        Commands::Simulate {
            target,
            leader,
            keep_going,
            steps,
        } => simulate(target, ThreadId(leader), config, &steps, keep_going),
    }
}

fn print_hardware_encoding(point: &EncodedPoint, interface: Interface, booke: bool)
{
    match (interface, point.span) {
        (Interface::RegisterArray, Span::Bytes(mask)) => {
            println!(
                "      value=0x{:x} ctrl=0x{:08x}",
                point.address.value(),
                aarch64::control_word(point.kind, mask)
            );
        }
        (Interface::Handles, _) => {
            let descriptor = powerpc::PpcHwBreakpoint::from(point);
            println!(
                "      trigger=0x{:x} mode=0x{:x} condition=0x{:08x} addr=0x{:x} addr2=0x{:x} value=0x{:x}",
                descriptor.trigger_type,
                descriptor.addr_mode,
                descriptor.condition_mode,
                descriptor.addr,
                descriptor.addr2,
                descriptor.condition_value
            );
        }
        (Interface::Legacy, _) => {
            println!("      dabr=0x{:x}", powerpc::dabr_value(point.address, point.kind, booke));
        }
        _ => {}
    }
}

fn simulate(target: Target, leader: ThreadId, config: ManagerConfig, steps: &[Step], keep_going: bool) -> HwResult<()>
{
    let mut manager = HwPointManager::new(target.kernel(), leader, config);
    println!("{}", manager.capabilities());

    for (i, step) in steps.iter().enumerate() {
        info!("Step {}: {}", i + 1, step);
        let result = run_step(&mut manager, step);
        match &result {
            Ok(()) => println!("[{}] {}: ok", i + 1, step),
            Err(err) => println!("[{}] {}: {}", i + 1, step, err),
        }
        if !keep_going {
            result?;
        }
    }

    println!("\nDegradation: {:?}", manager.degradation());
    println!("Kernel calls: {}", manager.kernel().log().len());
    manager.for_each_thread(|set| print!("{set}"));
    Ok(())
}

fn run_step(manager: &mut HwPointManager<SimulatedKernel>, step: &Step) -> HwResult<()>
{
    match step {
        Step::Insert(request) => manager.insert_point(request),
        Step::Remove(request) => manager.remove_point(request),
        Step::Thread(tid) => manager.on_new_thread(*tid),
        Step::Exit(tid) => {
            manager.on_thread_exit(*tid);
            Ok(())
        }
        Step::Resume(Some(tid)) => manager.prepare_to_resume(*tid),
        Step::Resume(None) => {
            for tid in manager.threads().to_vec() {
                manager.prepare_to_resume(tid)?;
            }
            Ok(())
        }
        Step::Reject => {
            manager
                .kernel_mut()
                .fail_next(Operation::WriteRegisters, KernelError::Rejected);
            Ok(())
        }
        Step::Vanish(tid) => {
            manager.kernel_mut().remove_thread(*tid);
            debug!("Thread {} removed from the simulated kernel", tid);
            Ok(())
        }
    }
}
