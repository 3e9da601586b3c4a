fn main() {
    if let Err(e) = monitor_agent::run() {
        // The logger may not be installed yet.
        eprintln!("monitor-agent: {}", e);
        std::process::exit(1);
    }
}
