use std::process::ExitCode;

use clap::Parser;

use plam_pack::cli::Cli;
use plam_pack::output;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match plam_pack::run(cli.command) {
        Ok(report) => match output::emit(cli.output, &report) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                output::emit_error(cli.output, 2, &e.to_string());
                ExitCode::from(2)
            }
        },
        Err(e) => {
            output::emit_error(cli.output, e.code(), &e.to_string());
            e.exit_code()
        }
    }
}
