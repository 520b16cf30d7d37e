fn main() {
    if let Err(e) = oai2ant_lib::run() {
        eprintln!("gateway failed: {}", e);
        std::process::exit(1);
    }
}
