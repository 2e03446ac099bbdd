use clap::Parser;
use ret2spec::{ RsbEnv, TimedRead, FlushReload };

/// Summarize how suitable this machine is for the ret2spec demos.
#[derive(Parser)]
struct Args {
    /// Also print the disassembly of the timed probe.
    #[arg(long)]
    disas: bool,

    /// Also calibrate the FLUSH+RELOAD hit threshold.
    #[arg(long)]
    calibrate: bool,
}

fn main() {
    let args = Args::parse();

    let cores = match RsbEnv::online_cores() {
        Some(n) => n.to_string(),
        None => "<unknown>".to_string(),
    };
    let isol = match RsbEnv::sysfs_isolated() {
        Ok(s) => s,
        Err(e) => format!("<{:?}>", e),
    };
    let smt = match RsbEnv::sysfs_smt_enabled() {
        Ok(true) => "enabled [!!]",
        Ok(false) => "disabled",
        Err(_) => "<unknown>",
    };

    println!("[*] 'ret2spec' environment summary:");
    println!("  {:<40}: {}", "online cores", cores);
    println!("  {:<40}: {}", "isolated cores", isol);
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)", smt);
    for vuln in ["spectre_v2", "retbleed", "spectre_v1"] {
        let desc = match RsbEnv::sysfs_vulnerability(vuln) {
            Ok(s) => s,
            Err(e) => format!("<{:?}>", e),
        };
        println!("  {:<40}: {}", vuln, desc);
    }

    if args.disas {
        match TimedRead::emit() {
            Ok(probe) => {
                println!("[*] timed probe:");
                for (bytes, instr) in probe.disas() {
                    println!("  {:<24} {}", bytes, instr);
                }
            },
            Err(e) => println!("[!] couldn't emit probe: {}", e),
        }
    }

    if args.calibrate {
        match FlushReload::new(0) {
            Ok(fr) => {
                println!("  {:<40}: {} cycles", "hit threshold", fr.threshold());
            },
            Err(e) => println!("[!] calibration failed: {}", e),
        }
    }
}
