/// corearena - a Core Wars style arena battle core
///
/// This is the CLI interface for running battles between bots written in
/// arena assembly. Exit codes: 0 success, 1 assembly error, 2 runtime error,
/// 3 invalid configuration.
use clap::{Arg, ArgAction, Command};
use corearena::{ArenaError, Assembler, BattleConfig, BattleSystem};
use log::{error, info};
use std::process;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let matches = Command::new("corearena")
        .version("0.1.0")
        .about("Core Wars style arena - deterministic battle core")
        .long_about(
            "corearena hosts battles between assembly programs competing inside a \
             shared circular memory. Bots are assembled from .asm sources, placed \
             at seeded random bases and scheduled round-robin until one bot's \
             processes survive alone.",
        )
        .subcommand(
            Command::new("run")
                .about("Run a battle between bots")
                .arg(
                    Arg::new("bots")
                        .help("Bot .asm source files to load")
                        .value_name("FILE")
                        .num_args(1..)
                        .required(true),
                )
                .arg(
                    Arg::new("seed")
                        .short('s')
                        .long("seed")
                        .help("Seed for deterministic placement and battles")
                        .value_name("SEED")
                        .value_parser(clap::value_parser!(u64))
                        .required(true),
                )
                .arg(
                    Arg::new("max-turns")
                        .short('t')
                        .long("max-turns")
                        .help("Turn limit before the timeout rules decide")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("cycles")
                        .short('c')
                        .long("cycles-per-turn")
                        .help("Instruction quantum per process per turn")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("memory")
                        .short('m')
                        .long("memory-size")
                        .help("Size of the shared memory in bytes")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("spacing")
                        .long("min-spacing")
                        .help("Minimum gap between loaded bots")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("pc-window")
                        .long("random-pc-window")
                        .help("Randomize the initial PC within the first N instructions")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("events")
                        .long("events")
                        .help("Print the event count per turn after the battle")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("asm")
                .about("Assemble a bot source file and report on the image")
                .arg(
                    Arg::new("input")
                        .help("Input .asm file")
                        .value_name("INPUT")
                        .required(true),
                )
                .arg(
                    Arg::new("disasm")
                        .short('d')
                        .long("disasm")
                        .help("Print the canonical disassembly of the image")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Display metadata of a bot source file")
                .arg(
                    Arg::new("file")
                        .help("Bot .asm file")
                        .value_name("FILE")
                        .required(true),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("run", sub_matches)) => run_battle(sub_matches),
        Some(("asm", sub_matches)) => assemble_file(sub_matches),
        Some(("info", sub_matches)) => show_bot_info(sub_matches),
        _ => {
            let mut cmd = Command::new("corearena");
            cmd.print_help().unwrap();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("{}", err);
        let code = err
            .downcast_ref::<ArenaError>()
            .map(ArenaError::exit_code)
            .unwrap_or(2);
        process::exit(code);
    }
}

/// Run a battle between the given bot files
fn run_battle(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let bot_files: Vec<String> = matches
        .get_many::<String>("bots")
        .unwrap()
        .cloned()
        .collect();

    let mut config = BattleConfig {
        seed: *matches.get_one::<u64>("seed").unwrap(),
        ..Default::default()
    };
    if let Some(&max_turns) = matches.get_one::<u64>("max-turns") {
        config.max_turns = max_turns;
    }
    if let Some(&cycles) = matches.get_one::<u32>("cycles") {
        config.cycles_per_turn = cycles;
    }
    if let Some(&memory) = matches.get_one::<usize>("memory") {
        config.memory_size = memory;
    }
    if let Some(&spacing) = matches.get_one::<usize>("spacing") {
        config.min_spacing = spacing;
    }
    if let Some(&window) = matches.get_one::<u32>("pc-window") {
        config.random_pc_window = window;
    }

    let mut system = BattleSystem::new(config)?;
    info!("loading {} bots...", bot_files.len());
    for file in &bot_files {
        system.load_bot_file(file)?;
    }

    let winner = system.run_to_completion()?;
    let stats = system.stats();

    println!("=== Battle Results ===");
    println!("Turns: {}", stats.turn);
    for bot in &stats.per_bot {
        println!(
            "  {:<16} processes alive: {:<4} cycles: {}",
            bot.name, bot.alive_processes, bot.total_cycles
        );
    }
    match winner {
        Some(pid) => {
            let snapshot = system.snapshot();
            let name = snapshot
                .processes
                .iter()
                .find(|p| p.id == pid)
                .map(|p| p.owner_bot.as_str())
                .unwrap_or("unknown");
            println!("Winner: {} (process {})", name, pid);
        }
        None => println!("Result: draw"),
    }
    if matches.get_flag("events") {
        println!("Events recorded: {}", stats.events);
    }
    Ok(())
}

/// Assemble a source file and report on the produced image
fn assemble_file(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let input = matches.get_one::<String>("input").unwrap();
    let assembler = Assembler::new();
    let image = assembler.assemble_file(input)?;

    println!("Assembled {} -> {} bytes", input, image.size());
    println!("Name: {}", image.name);
    println!("Entry offset: {:#06x}", image.entry_offset);
    println!("Relocations: {}", image.relocations.len());
    if !image.symbols.is_empty() {
        println!("Symbols:");
        for (name, entry) in image.symbols.iter() {
            println!("  {:<16} {:#06x} ({:?})", name, entry.value, entry.kind);
        }
    }
    if matches.get_flag("disasm") {
        println!("--- disassembly ---");
        print!("{}", assembler.disassemble(&image));
    }
    Ok(())
}

/// Show metadata of a bot source file
fn show_bot_info(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let file = matches.get_one::<String>("file").unwrap();
    let image = Assembler::new().assemble_file(file)?;

    println!("Bot Information");
    println!("===============");
    println!("File: {}", file);
    println!("Name: {}", image.name);
    if !image.author.is_empty() {
        println!("Author: {}", image.author);
    }
    if !image.version.is_empty() {
        println!("Version: {}", image.version);
    }
    if !image.strategy.is_empty() {
        println!("Strategy: {}", image.strategy);
    }
    println!("Code size: {} bytes", image.size());
    Ok(())
}
