fn main() {
    if let Err(err) = studyguard_lib::run() {
        log::error!("{err:#}");
        eprintln!("studyguard: {err:#}");
        std::process::exit(1);
    }
}
