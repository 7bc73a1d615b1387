use clap::Parser;
use tracing_subscriber::EnvFilter;

use dm_bytecode::cli::{run, Mode};

fn main() {
    macro_rules! crash {
        ($ret:literal : $($tt:tt)*) => {{
            eprintln!($($tt)*);
            std::process::exit($ret);
        }}
    }

    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        hook(panic_info);
        crash!(666: "unrecoverable error");
    }));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    run(Mode::parse());
}
