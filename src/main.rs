use reframe::{app, cli, log_error, logging, signals};

fn main() {
    let cli = cli::parse();
    signals::install();

    match app::run(cli) {
        Ok(()) => {
            logging::finish(true);
        }
        Err(error) => {
            log_error!("{error}");
            logging::finish(false);
            std::process::exit(error.exit_code());
        }
    }
}
