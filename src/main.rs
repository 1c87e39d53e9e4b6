use tether::{logging, runtime, supervisor};

fn print_help() {
    println!("tether -- Telegram bridge for coding-agent CLIs\n");
    println!("Usage: tether [command]\n");
    println!("Commands:");
    println!("  (none)       Run under the supervisor (auto-restart)");
    println!("  run          Run the bot process directly");
    println!("  version      Print the version");
    println!("  help         Show this help");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("");

    let result = match command {
        "" | "supervise" => {
            logging::init_logging("info");
            supervisor::supervise().await
        }
        "run" => runtime::run_bot().await,
        "version" | "--version" | "-V" => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}\n");
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
