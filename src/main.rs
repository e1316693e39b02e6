fn main() {
    if let Err(e) = rucio_workflow::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
