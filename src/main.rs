use direvent::cli::Args;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = Args::parse_args();

    match direvent::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("direvent: {e}");
            match e {
                direvent::error::Error::Config(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}
