mod arch;
mod cli;
mod control;
mod dedup;
mod error;
mod file_format;
mod perf_event;
mod record;
mod record_cmd;
mod report;
mod symbols;
mod unwind;
mod vr;

use clap::Parser;

use cli::{Action, Opt};

fn main() -> std::process::ExitCode {
    let opt = Opt::parse();

    let default_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match opt.action {
        Action::Record(args) => record_cmd::run(args),
        Action::Report(args) => report::cmd_report(args),
        Action::Stat(args) => report::cmd_stat(args),
        Action::List(args) => report::cmd_list(args),
        Action::Dump(args) => report::cmd_dump(args),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
