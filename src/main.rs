fn main() {
    let exit_code = match durus::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("durus: {:#}", err);
            1
        }
    };
    std::process::exit(exit_code);
}
