fn main() {
    if let Err(err) = csv_loader::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
