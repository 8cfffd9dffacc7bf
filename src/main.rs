use clap::Parser;
use speed_check::cli;
use tracing::error;

fn main() {
    let args = cli::Args::parse();
    let code = match cli::dispatch(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("error: {:#}", err);
            cli::EXIT_ERRORS
        }
    };
    std::process::exit(code);
}
