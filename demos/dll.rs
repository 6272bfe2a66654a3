use clap::Parser;

use symheap_rs::exec::{AbstractionPolicy, ExecConfig, Executor};
use symheap_rs::program::{Block, Cmp, Function, Operand, Place, Program};

/// `struct item { struct item *next, *prev; }`
const ITEM: u32 = 16;
const NEXT: i64 = 0;
const PREV: i64 = 8;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Config string ("" or "fast").
    #[arg(long, value_name = "STR", default_value = "")]
    config: String,

    /// Fold shapes after every heap write instead of at block entries.
    #[clap(long)]
    eager: bool,

    /// Free the rest of the list instead of returning with it.
    #[clap(long)]
    drain: bool,

    /// Ceiling on the number of executed steps.
    #[clap(long, value_name = "INT")]
    max_states: Option<usize>,

    /// Print engine traces.
    #[clap(long)]
    debug: bool,
}

/// Create a doubly-linked list of unknown length, then cut off its head and tail.
fn cut_dll(drain: bool) -> Program {
    let create = |b: Block, var: &str| {
        b.alloc(Place::var(var), ITEM)
            .assign(Place::field(var, NEXT), Operand::Null)
            .assign(Place::field(var, PREV), Operand::Null)
    };

    let entry = create(Block::new("entry"), "now")
        .assign(Place::var("beg"), Operand::var("now"))
        .jump("loop");
    let head = Block::new("loop").cond(Operand::Unknown, Cmp::Ne, Operand::Int(0), "body", "cut");
    let body = create(Block::new("body"), "tmp")
        .assign(Place::field("now", NEXT), Operand::var("tmp"))
        .assign(Place::field("tmp", PREV), Operand::var("now"))
        .assign(Place::var("now"), Operand::var("tmp"))
        .jump("loop");
    let cut = Block::new("cut")
        .assign(Place::var("end"), Operand::var("now"))
        .assign(Place::var("b"), Operand::var("beg"))
        .assign(Place::var("e"), Operand::var("end"))
        .assign(Place::var("beg"), Operand::load("b", NEXT))
        .assign(Place::var("end"), Operand::load("e", PREV))
        .free(Operand::var("b"))
        .free(Operand::var("e"))
        .cond(Operand::var("beg"), Cmp::Eq, Operand::var("end"), "same", "differ");
    let next = if drain { "drain" } else { "done" };

    let mut main = Function::new("main")
        .block(entry)
        .block(head)
        .block(body)
        .block(cut)
        .block(Block::new("same").jump(next))
        .block(Block::new("differ").jump(next));
    if drain {
        main = main
            .block(Block::new("drain").cond(Operand::var("beg"), Cmp::Eq, Operand::Null, "done", "drain_body"))
            .block(
                Block::new("drain_body")
                    .assign(Place::var("tmp"), Operand::load("beg", NEXT))
                    .free(Operand::var("beg"))
                    .assign(Place::var("beg"), Operand::var("tmp"))
                    .jump("drain"),
            );
    }
    main = main.block(Block::new("done").ret());
    Program::new().function(main)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();

    simplelog::TermLogger::init(
        if args.debug {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    println!("args = {:?}", args);

    let time_total = std::time::Instant::now();

    let mut config: ExecConfig = args.config.parse()?;
    if args.eager {
        config.abstraction = AbstractionPolicy::Eager;
    }
    if let Some(max_states) = args.max_states {
        config.max_states = max_states;
    }
    println!("config = {:?}", config);

    let program = cut_dll(args.drain);
    let report = Executor::new(&program, config).run()?;
    println!("{}", report);

    let time_total = time_total.elapsed();
    println!("\nAll done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
